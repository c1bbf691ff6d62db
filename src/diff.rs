//! Incremental diff application for generator outputs.
//!
//! On the diff-capable protocols a generator sends its first output in full
//! and every later output as a list of edit operations against the previous
//! one:
//!
//! ```text
//! ["replace", [0, "text"], "new value"]
//! ["append",  [0, "text"], " more"]
//! ["add",     [1, 2],      {"inserted": true}]
//! ["delete",  [1, 0],      null]
//! ```
//!
//! Operations apply left to right to a copy of the base value. The base is
//! never mutated, so a failed diff leaves the cached output intact.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Number, Value};
use thiserror::Error;

use crate::models::{display_path, PathSegment};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("Unknown diff action: {0}")]
    UnknownAction(String),

    #[error("Malformed diff: {0}")]
    Malformed(String),

    #[error("Cannot append {value} to {target}")]
    UnsupportedAppend {
        target: &'static str,
        value: &'static str,
    },

    #[error("Action `{0}` is not supported at the root")]
    UnsupportedRootAction(DiffAction),

    #[error("Diff path not found: {0}")]
    PathNotFound(String),

    #[error("Index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Numeric append overflowed")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    Replace,
    Append,
    Add,
    Delete,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiffAction::Replace => "replace",
            DiffAction::Append => "append",
            DiffAction::Add => "add",
            DiffAction::Delete => "delete",
        })
    }
}

impl FromStr for DiffAction {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(DiffAction::Replace),
            "append" => Ok(DiffAction::Append),
            "add" => Ok(DiffAction::Add),
            "delete" => Ok(DiffAction::Delete),
            other => Err(DiffError::UnknownAction(other.to_string())),
        }
    }
}

/// One edit operation: action, address, operand.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOp {
    pub action: DiffAction,
    pub path: Vec<PathSegment>,
    pub value: Value,
}

impl DiffOp {
    pub fn new(action: DiffAction, path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            action,
            path,
            value,
        }
    }

    /// Parse a wire triple `[action, path, value]`.
    pub fn from_value(raw: &Value) -> Result<Self, DiffError> {
        let parts = raw
            .as_array()
            .filter(|parts| parts.len() == 3)
            .ok_or_else(|| DiffError::Malformed(format!("expected [action, path, value], got {}", raw)))?;
        let action = parts[0]
            .as_str()
            .ok_or_else(|| DiffError::Malformed(format!("action must be a string, got {}", parts[0])))?
            .parse()?;
        let path: Vec<PathSegment> = serde_json::from_value(parts[1].clone())
            .map_err(|e| DiffError::Malformed(format!("invalid path {}: {}", parts[1], e)))?;
        Ok(Self::new(action, path, parts[2].clone()))
    }
}

/// Parse a list of wire triples.
pub fn parse_ops(diff: &Value) -> Result<Vec<DiffOp>, DiffError> {
    diff.as_array()
        .ok_or_else(|| DiffError::Malformed(format!("diff must be a list, got {}", diff)))?
        .iter()
        .map(DiffOp::from_value)
        .collect()
}

/// Apply `ops` in order to a copy of `base`.
///
/// # Errors
///
/// Fails on the first operation that does not fit the value. `base` is left
/// untouched either way.
///
/// # Example
///
/// ```ignore
/// let ops = parse_ops(&json!([["append", [], " world"]]))?;
/// assert_eq!(apply_diff(&json!("hello"), &ops)?, json!("hello world"));
/// ```
pub fn apply_diff(base: &Value, ops: &[DiffOp]) -> Result<Value, DiffError> {
    let mut target = base.clone();
    for op in ops {
        target = apply_edit(target, op)?;
    }
    Ok(target)
}

fn apply_edit(mut target: Value, op: &DiffOp) -> Result<Value, DiffError> {
    let Some((last, parents)) = op.path.split_last() else {
        return match op.action {
            DiffAction::Replace => Ok(op.value.clone()),
            DiffAction::Append => append_root(target, &op.value),
            action => Err(DiffError::UnsupportedRootAction(action)),
        };
    };

    let mut container = &mut target;
    for (depth, segment) in parents.iter().enumerate() {
        container = descend(container, segment, &op.path[..=depth])?;
    }

    match op.action {
        DiffAction::Replace => match container {
            Value::Array(items) => {
                let index = list_index(last, &op.path)?;
                let len = items.len();
                let slot = items
                    .get_mut(index)
                    .ok_or(DiffError::IndexOutOfBounds { index, len })?;
                *slot = op.value.clone();
            }
            Value::Object(map) => {
                map.insert(last.as_key(), op.value.clone());
            }
            _ => return Err(DiffError::PathNotFound(display_path(&op.path))),
        },
        DiffAction::Append => {
            let slot = descend(container, last, &op.path)?;
            append_in_place(slot, &op.value)?;
        }
        DiffAction::Add => match container {
            // Splice semantics: an index past the end appends.
            Value::Array(items) => {
                let index = list_index(last, &op.path)?.min(items.len());
                items.insert(index, op.value.clone());
            }
            Value::Object(map) => {
                map.insert(last.as_key(), op.value.clone());
            }
            _ => return Err(DiffError::PathNotFound(display_path(&op.path))),
        },
        DiffAction::Delete => match container {
            // Servers delete shrinking tails one index at a time, so an
            // index past the end is a no-op.
            Value::Array(items) => {
                let index = list_index(last, &op.path)?;
                if index < items.len() {
                    items.remove(index);
                }
            }
            Value::Object(map) => {
                map.shift_remove(&last.as_key())
                    .ok_or_else(|| DiffError::PathNotFound(display_path(&op.path)))?;
            }
            _ => return Err(DiffError::PathNotFound(display_path(&op.path))),
        },
    }
    Ok(target)
}

fn descend<'a>(
    container: &'a mut Value,
    segment: &PathSegment,
    path: &[PathSegment],
) -> Result<&'a mut Value, DiffError> {
    match container {
        Value::Array(items) => {
            let index = list_index(segment, path)?;
            let len = items.len();
            items
                .get_mut(index)
                .ok_or(DiffError::IndexOutOfBounds { index, len })
        }
        other => segment
            .child_mut(other)
            .ok_or_else(|| DiffError::PathNotFound(display_path(path))),
    }
}

fn list_index(segment: &PathSegment, path: &[PathSegment]) -> Result<usize, DiffError> {
    segment
        .as_index()
        .ok_or_else(|| DiffError::PathNotFound(display_path(path)))
}

fn append_root(target: Value, value: &Value) -> Result<Value, DiffError> {
    match (target, value) {
        (Value::String(mut text), Value::String(more)) => {
            text.push_str(more);
            Ok(Value::String(text))
        }
        (target, value) => Err(DiffError::UnsupportedAppend {
            target: type_name(&target),
            value: type_name(value),
        }),
    }
}

fn append_in_place(slot: &mut Value, value: &Value) -> Result<(), DiffError> {
    match (slot, value) {
        (Value::String(text), Value::String(more)) => text.push_str(more),
        (Value::Array(items), Value::Array(more)) => items.extend(more.iter().cloned()),
        (Value::Number(current), Value::Number(more)) => *current = add_numbers(current, more)?,
        (slot, value) => {
            return Err(DiffError::UnsupportedAppend {
                target: type_name(slot),
                value: type_name(value),
            })
        }
    }
    Ok(())
}

fn add_numbers(a: &Number, b: &Number) -> Result<Number, DiffError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.checked_add(y).map(Number::from).ok_or(DiffError::Overflow);
    }
    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    Number::from_f64(sum).ok_or(DiffError::Overflow)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Fold one generator frame into the per-event output cache.
///
/// The first frame for `event_id` is stored as sent. Every later frame holds
/// one diff per output slot; each slot is patched against the cache and the
/// frame's `data` is overwritten with the reconstructed values. The cache is
/// only written when every slot applied cleanly.
///
/// # Errors
///
/// Returns an error when `output.data` is not a list or any slot fails to apply.
pub fn apply_diff_stream(
    cache: &mut HashMap<String, Vec<Value>>,
    event_id: &str,
    output: &mut Value,
) -> Result<(), DiffError> {
    let slots = output
        .get_mut("data")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| DiffError::Malformed("output.data must be a list".to_string()))?;

    let Some(previous) = cache.get_mut(event_id) else {
        cache.insert(event_id.to_string(), slots.clone());
        return Ok(());
    };

    let null = Value::Null;
    let patched = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let base = previous.get(i).unwrap_or(&null);
            apply_diff(base, &parse_ops(slot)?)
        })
        .collect::<Result<Vec<_>, _>>()?;

    *previous = patched.clone();
    *slots = patched;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ops(raw: Value) -> Vec<DiffOp> {
        parse_ops(&raw).unwrap()
    }

    #[test]
    fn test_root_replace_and_append() {
        assert_eq!(
            apply_diff(&json!("old"), &ops(json!([["replace", [], "new"]]))).unwrap(),
            json!("new")
        );
        assert_eq!(
            apply_diff(&json!("he"), &ops(json!([["append", [], "llo"]]))).unwrap(),
            json!("hello")
        );
    }

    #[test]
    fn test_root_append_rejects_non_strings() {
        let err = apply_diff(&json!([1]), &ops(json!([["append", [], [2]]]))).unwrap_err();
        assert_eq!(
            err,
            DiffError::UnsupportedAppend {
                target: "list",
                value: "list"
            }
        );
    }

    #[test]
    fn test_root_add_unsupported() {
        let err = apply_diff(&json!({}), &ops(json!([["add", [], 1]]))).unwrap_err();
        assert_eq!(err, DiffError::UnsupportedRootAction(DiffAction::Add));
    }

    #[test]
    fn test_nested_append_kinds() {
        let base = json!({"text": "a", "count": 1, "items": [1], "ratio": 0.5});
        let result = apply_diff(
            &base,
            &ops(json!([
                ["append", ["text"], "b"],
                ["append", ["count"], 2],
                ["append", ["items"], [2, 3]],
                ["append", ["ratio"], 0.25]
            ])),
        )
        .unwrap();
        assert_eq!(
            result,
            json!({"text": "ab", "count": 3, "items": [1, 2, 3], "ratio": 0.75})
        );
    }

    #[test]
    fn test_add_on_list_and_object() {
        let result = apply_diff(
            &json!({"list": [1, 3], "map": {"a": 1}}),
            &ops(json!([
                ["add", ["list", 1], 2],
                ["add", ["map", "b"], 2],
                ["add", ["map", "a"], 10]
            ])),
        )
        .unwrap();
        assert_eq!(result, json!({"list": [1, 2, 3], "map": {"a": 10, "b": 2}}));
    }

    #[test]
    fn test_delete_keeps_key_order() {
        let result = apply_diff(
            &json!({"a": 1, "b": 2, "c": 3, "list": [1, 2, 3]}),
            &ops(json!([["delete", ["a"], null], ["delete", ["list", 0], null]])),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"b":2,"c":3,"list":[2,3]}"#
        );
    }

    #[test]
    fn test_base_not_mutated_on_failure() {
        let base = json!({"text": "keep"});
        let err = apply_diff(
            &base,
            &ops(json!([["replace", ["text"], "x"], ["delete", ["missing"], null]])),
        )
        .unwrap_err();
        assert_eq!(err, DiffError::PathNotFound("missing".into()));
        assert_eq!(base, json!({"text": "keep"}));
    }

    #[test]
    fn test_list_shrinking_by_two() {
        // Ascending deletes: the second index lands past the shrunken end.
        let result = apply_diff(
            &json!(["a", "b", "c"]),
            &ops(json!([["delete", [1], null], ["delete", [2], null]])),
        )
        .unwrap();
        assert_eq!(result, json!(["a", "c"]));

        let result = apply_diff(
            &json!({"rows": ["x", "y", "z"]}),
            &ops(json!([["delete", ["rows", 1], null], ["delete", ["rows", 2], null]])),
        )
        .unwrap();
        assert_eq!(result, json!({"rows": ["x", "z"]}));
    }

    #[test]
    fn test_add_past_end_appends() {
        let result = apply_diff(&json!([1, 2]), &ops(json!([["add", [7], 3]]))).unwrap();
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn test_numeric_add_inserts_in_lists_and_overwrites_in_maps() {
        let list = apply_diff(&json!(["a", "b", "c"]), &ops(json!([["add", [2], "x"]]))).unwrap();
        assert_eq!(list, json!(["a", "b", "x", "c"]));

        let map = apply_diff(
            &json!({"2": "old", "3": "keep"}),
            &ops(json!([["add", [2], "x"]])),
        )
        .unwrap();
        assert_eq!(map, json!({"2": "x", "3": "keep"}));
    }

    #[test]
    fn test_index_out_of_bounds() {
        let err = apply_diff(&json!([1]), &ops(json!([["replace", [4], 0]]))).unwrap_err();
        assert_eq!(err, DiffError::IndexOutOfBounds { index: 4, len: 1 });
    }

    #[test]
    fn test_unknown_action() {
        let err = parse_ops(&json!([["merge", [], 1]])).unwrap_err();
        assert_eq!(err, DiffError::UnknownAction("merge".into()));
    }

    #[test]
    fn test_empty_diff_is_identity() {
        let base = json!({"a": [1, 2]});
        assert_eq!(apply_diff(&base, &[]).unwrap(), base);
    }

    #[test]
    fn test_diff_stream_seeds_then_patches() {
        let mut cache = HashMap::new();

        let mut first = json!({"data": ["", {"n": 1}]});
        apply_diff_stream(&mut cache, "abc", &mut first).unwrap();
        assert_eq!(first, json!({"data": ["", {"n": 1}]}));

        let mut second = json!({"data": [[["append", [], "hello"]], [["replace", ["n"], 2]]]});
        apply_diff_stream(&mut cache, "abc", &mut second).unwrap();
        assert_eq!(second, json!({"data": ["hello", {"n": 2}]}));
        assert_eq!(cache["abc"], vec![json!("hello"), json!({"n": 2})]);
    }

    #[test]
    fn test_diff_stream_failure_keeps_cache() {
        let mut cache = HashMap::new();
        cache.insert("abc".to_string(), vec![json!("hi"), json!(1)]);

        let mut frame = json!({"data": [[["append", [], "!"]], [["explode", [], 0]]]});
        assert!(apply_diff_stream(&mut cache, "abc", &mut frame).is_err());
        assert_eq!(cache["abc"], vec![json!("hi"), json!(1)]);
    }
}
