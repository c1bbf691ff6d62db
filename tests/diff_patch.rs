//! Integration tests for generator output reconstruction.
//!
//! Drives the public diff API the way the multiplexed lifecycle does: one
//! seed frame followed by per-slot diffs.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use queuecall::diff::{apply_diff, apply_diff_stream, parse_ops, DiffAction, DiffError, DiffOp};
use queuecall::models::PathSegment;

fn output(data: Value) -> Value {
    json!({"data": data, "is_generating": true})
}

#[test]
fn test_chat_history_streams_token_by_token() {
    let mut cache = HashMap::new();

    let mut seed = output(json!([[["hi", ""]], "status"]));
    apply_diff_stream(&mut cache, "chat", &mut seed).unwrap();
    assert_eq!(seed["data"], json!([[["hi", ""]], "status"]));

    for token in ["Hel", "lo", "!"] {
        let mut frame = output(json!([[["append", [0, 1], token]], []]));
        apply_diff_stream(&mut cache, "chat", &mut frame).unwrap();
    }

    let mut next_turn = output(json!([
        [["add", [1], ["how are you?", ""]]],
        [["replace", [], "thinking"]]
    ]));
    apply_diff_stream(&mut cache, "chat", &mut next_turn).unwrap();
    assert_eq!(
        next_turn["data"],
        json!([[["hi", "Hello!"], ["how are you?", ""]], "thinking"])
    );
    assert_eq!(cache["chat"], next_turn["data"].as_array().unwrap().clone());
}

#[test]
fn test_streams_are_cached_per_event() {
    let mut cache = HashMap::new();
    apply_diff_stream(&mut cache, "a", &mut output(json!(["a"]))).unwrap();
    apply_diff_stream(&mut cache, "b", &mut output(json!(["b"]))).unwrap();

    let mut frame = output(json!([[["append", [], "1"]]]));
    apply_diff_stream(&mut cache, "a", &mut frame).unwrap();

    assert_eq!(frame["data"], json!(["a1"]));
    assert_eq!(cache["b"], vec![json!("b")]);
}

#[test]
fn test_object_edits_address_keys() {
    let base = json!({"rows": [{"id": 1}], "meta": {"count": 1}});
    let ops = vec![
        DiffOp::new(
            DiffAction::Add,
            vec![PathSegment::from("rows"), PathSegment::from(1usize)],
            json!({"id": 2}),
        ),
        DiffOp::new(
            DiffAction::Append,
            vec![PathSegment::from("meta"), PathSegment::from("count")],
            json!(1),
        ),
        DiffOp::new(DiffAction::Add, vec![PathSegment::from("done")], json!(true)),
    ];

    assert_eq!(
        apply_diff(&base, &ops).unwrap(),
        json!({"rows": [{"id": 1}, {"id": 2}], "meta": {"count": 2}, "done": true})
    );
}

#[test]
fn test_gallery_shrinking_mid_stream_keeps_the_call_alive() {
    let mut cache = HashMap::new();
    apply_diff_stream(&mut cache, "g", &mut output(json!([["a.png", "b.png", "c.png"]]))).unwrap();

    let mut frame = output(json!([[["delete", [1], null], ["delete", [2], null]]]));
    apply_diff_stream(&mut cache, "g", &mut frame).unwrap();
    assert_eq!(frame["data"], json!([["a.png", "c.png"]]));

    let mut frame = output(json!([[["add", [5], "d.png"]]]));
    apply_diff_stream(&mut cache, "g", &mut frame).unwrap();
    assert_eq!(cache["g"], vec![json!(["a.png", "c.png", "d.png"])]);
}

#[test]
fn test_numeric_add_depends_on_container() {
    let op = [DiffOp::new(DiffAction::Add, vec![PathSegment::from(2usize)], json!("x"))];

    assert_eq!(
        apply_diff(&json!(["a", "b", "c"]), &op).unwrap(),
        json!(["a", "b", "x", "c"])
    );
    assert_eq!(
        apply_diff(&json!({"2": "old"}), &op).unwrap(),
        json!({"2": "x"})
    );
}

#[test]
fn test_errors_name_the_failing_path() {
    let base = json!({"rows": []});

    let missing = parse_ops(&json!([["append", ["cols", 0], "x"]])).unwrap();
    assert_eq!(
        apply_diff(&base, &missing).unwrap_err(),
        DiffError::PathNotFound("cols".to_string())
    );

    let past_end = parse_ops(&json!([["replace", ["rows", 0], 1]])).unwrap();
    assert_eq!(
        apply_diff(&base, &past_end).unwrap_err(),
        DiffError::IndexOutOfBounds { index: 0, len: 0 }
    );

    assert!(matches!(
        parse_ops(&json!([["move", [], null]])),
        Err(DiffError::UnknownAction(action)) if action == "move"
    ));
}

#[test]
fn test_bad_frame_leaves_cache_untouched() {
    let mut cache = HashMap::new();
    apply_diff_stream(&mut cache, "e", &mut output(json!(["ok", 1]))).unwrap();

    let mut frame = output(json!([[["append", [], "!"]], [["append", [], "x"]]]));
    assert!(apply_diff_stream(&mut cache, "e", &mut frame).is_err());
    assert_eq!(cache["e"], vec![json!("ok"), json!(1)]);
}
