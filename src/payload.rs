//! Payload preparation: attachment extraction and file re-insertion.
//!
//! Call arguments may hold binary attachments anywhere in their tree. Before
//! submission every attachment is lifted out into a [`BlobRef`] that records
//! where it lived, the tree is sanitized into plain JSON, and once the
//! uploads finish the server file handles are written back at those paths.
//!
//! ```text
//! [ "caption", {"image": <bytes>} ]
//!        | walk_and_store_blobs
//!        v
//! data:  [ "caption", {"image": null} ]
//! blobs: [ BlobRef { path: [1, "image"], .. } ]
//!        | upload + update_object
//!        v
//! [ "caption", {"image": {"path": "/tmp/a.png", "meta": {...}}} ]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::{display_path, PathSegment};

/// `meta._type` marker of a file reference object.
pub const FILE_DATA_TYPE: &str = "gradio.FileData";
/// Component whose file inputs are sent as bare handle strings.
pub const GALLERY_COMPONENT: &str = "Gallery";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Path {0} does not address a value in the payload")]
    InvalidPath(String),

    #[error("Cannot update the payload at an empty path")]
    EmptyPath,
}

// =============================================================================
// Argument values
// =============================================================================

/// Opaque binary attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryHandle {
    Bytes {
        data: Bytes,
        name: Option<String>,
        mime: Option<String>,
    },
    /// A file on local disk, read at upload time.
    Path(PathBuf),
}

impl BinaryHandle {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        BinaryHandle::Bytes {
            data: data.into(),
            name: None,
            mime: None,
        }
    }

    pub fn named(data: impl Into<Bytes>, name: impl Into<String>) -> Self {
        BinaryHandle::Bytes {
            data: data.into(),
            name: Some(name.into()),
            mime: None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        BinaryHandle::Path(path.as_ref().to_path_buf())
    }

    /// Original file name, when one is known.
    pub fn file_name(&self) -> Option<String> {
        match self {
            BinaryHandle::Bytes { name, .. } => name.clone(),
            BinaryHandle::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }
}

/// A call argument: plain JSON, or a tree that may contain attachments.
#[derive(Debug, Clone, PartialEq)]
pub enum CallValue {
    Json(Value),
    Array(Vec<CallValue>),
    Object(BTreeMap<String, CallValue>),
    /// An attachment slot. `None` marks a removed file and is never uploaded.
    Blob(Option<BinaryHandle>),
}

impl From<Value> for CallValue {
    fn from(value: Value) -> Self {
        CallValue::Json(value)
    }
}

impl From<BinaryHandle> for CallValue {
    fn from(handle: BinaryHandle) -> Self {
        CallValue::Blob(Some(handle))
    }
}

impl From<&str> for CallValue {
    fn from(text: &str) -> Self {
        CallValue::Json(Value::String(text.to_string()))
    }
}

impl From<Vec<CallValue>> for CallValue {
    fn from(items: Vec<CallValue>) -> Self {
        CallValue::Array(items)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Location and content of one attachment lifted out of a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRef {
    pub path: Vec<PathSegment>,
    pub blob: Option<BinaryHandle>,
    /// Component type of the root parameter the attachment belongs to.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPayload {
    /// Arguments with every attachment replaced by `null`.
    pub data: Vec<Value>,
    /// Attachments in depth-first order.
    pub blobs: Vec<BlobRef>,
}

/// Lift every attachment out of `data`.
///
/// `parameter_types` holds the component type of each root parameter. The
/// type is inherited through nested lists but not through object fields.
/// JSON objects that reference a local file (`meta._type` of
/// [`FILE_DATA_TYPE`] with a `path` and no `url`) count as attachments.
pub fn walk_and_store_blobs(data: &[CallValue], parameter_types: &[Option<String>]) -> PreparedPayload {
    let mut blobs = Vec::new();
    let data = data
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let kind = parameter_types.get(i).and_then(Option::as_deref);
            walk(value, kind, vec![PathSegment::Index(i)], &mut blobs)
        })
        .collect();
    PreparedPayload { data, blobs }
}

fn walk(value: &CallValue, kind: Option<&str>, path: Vec<PathSegment>, blobs: &mut Vec<BlobRef>) -> Value {
    match value {
        CallValue::Blob(handle) => {
            blobs.push(BlobRef {
                path,
                blob: handle.clone(),
                kind: kind.map(str::to_string),
            });
            Value::Null
        }
        CallValue::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| walk(item, kind, child(&path, PathSegment::Index(i)), blobs))
                .collect(),
        ),
        CallValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| {
                    let path = child(&path, PathSegment::Key(key.clone()));
                    (key.clone(), walk(field, None, path, blobs))
                })
                .collect(),
        ),
        CallValue::Json(json) => walk_json(json, kind, path, blobs),
    }
}

fn walk_json(value: &Value, kind: Option<&str>, path: Vec<PathSegment>, blobs: &mut Vec<BlobRef>) -> Value {
    match value {
        Value::Object(fields) => {
            if let Some(local) = local_file(fields) {
                blobs.push(BlobRef {
                    path,
                    blob: Some(BinaryHandle::Path(local)),
                    kind: kind.map(str::to_string),
                });
                return Value::Null;
            }
            Value::Object(
                fields
                    .iter()
                    .map(|(key, field)| {
                        let path = child(&path, PathSegment::Key(key.clone()));
                        (key.clone(), walk_json(field, None, path, blobs))
                    })
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| walk_json(item, kind, child(&path, PathSegment::Index(i)), blobs))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn local_file(fields: &Map<String, Value>) -> Option<PathBuf> {
    let is_file_data = fields
        .get("meta")
        .and_then(|meta| meta.get("_type"))
        .and_then(Value::as_str)
        == Some(FILE_DATA_TYPE);
    let has_url = fields.get("url").is_some_and(|url| !url.is_null());
    if !is_file_data || has_url {
        return None;
    }
    fields.get("path").and_then(Value::as_str).map(PathBuf::from)
}

fn child(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut next = path.to_vec();
    next.push(segment);
    next
}

// =============================================================================
// Re-insertion
// =============================================================================

/// Value written back in place of an uploaded attachment.
///
/// Gallery parameters take the bare handle. Everything else takes a file
/// reference object carrying the original name when known.
pub fn file_reference(handle: &str, blob: &BlobRef) -> Value {
    if blob.kind.as_deref() == Some(GALLERY_COMPONENT) {
        return Value::String(handle.to_string());
    }
    let mut file = json!({
        "path": handle,
        "meta": {"_type": FILE_DATA_TYPE},
    });
    if let Some(name) = blob.blob.as_ref().and_then(BinaryHandle::file_name) {
        file["orig_name"] = Value::String(name);
    }
    file
}

/// Overwrite the value at `path` in the argument list.
///
/// # Errors
///
/// Returns [`PayloadError::InvalidPath`] when an intermediate step does not
/// exist or is not a container.
pub fn update_object(data: &mut [Value], new_value: Value, path: &[PathSegment]) -> Result<(), PayloadError> {
    let (first, rest) = path.split_first().ok_or(PayloadError::EmptyPath)?;
    let invalid = || PayloadError::InvalidPath(display_path(path));

    let root = first
        .as_index()
        .and_then(|index| data.get_mut(index))
        .ok_or_else(invalid)?;
    let Some((last, parents)) = rest.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        current = segment.child_mut(current).ok_or_else(invalid)?;
    }
    match current {
        Value::Array(items) => {
            let slot = last
                .as_index()
                .and_then(|index| items.get_mut(index))
                .ok_or_else(invalid)?;
            *slot = new_value;
        }
        Value::Object(fields) => {
            fields.insert(last.as_key(), new_value);
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

/// A blob paired with the handle the server issued for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBlob {
    pub blob_ref: BlobRef,
    pub handle: String,
}

/// Write every resolved handle back into the sanitized arguments.
pub fn insert_resolved(data: &mut [Value], resolved: &[ResolvedBlob]) -> Result<(), PayloadError> {
    for item in resolved {
        let reference = file_reference(&item.handle, &item.blob_ref);
        update_object(data, reference, &item.blob_ref.path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_json_passes_through() {
        let data = vec![CallValue::from(json!({"a": [1, 2]})), CallValue::from("x")];
        let prepared = walk_and_store_blobs(&data, &[]);
        assert!(prepared.blobs.is_empty());
        assert_eq!(prepared.data, vec![json!({"a": [1, 2]}), json!("x")]);
    }

    #[test]
    fn test_nested_blob_paths() {
        let mut fields = BTreeMap::new();
        fields.insert("image".to_string(), CallValue::from(BinaryHandle::from_bytes(vec![1u8, 2, 3])));
        let data = vec![
            CallValue::from("caption"),
            CallValue::Array(vec![CallValue::Json(json!(0)), CallValue::Object(fields)]),
        ];

        let prepared = walk_and_store_blobs(&data, &[None, Some("Gallery".into())]);
        assert_eq!(prepared.data, vec![json!("caption"), json!([0, {"image": null}])]);
        assert_eq!(prepared.blobs.len(), 1);
        assert_eq!(
            prepared.blobs[0].path,
            vec![PathSegment::Index(1), PathSegment::Index(1), PathSegment::Key("image".into())]
        );
        // Object fields do not inherit the parameter type.
        assert_eq!(prepared.blobs[0].kind, None);
    }

    #[test]
    fn test_list_items_inherit_parameter_type() {
        let data = vec![CallValue::Array(vec![CallValue::from(BinaryHandle::from_bytes(vec![0u8]))])];
        let prepared = walk_and_store_blobs(&data, &[Some("Gallery".into())]);
        assert_eq!(prepared.blobs[0].kind.as_deref(), Some("Gallery"));
    }

    #[test]
    fn test_file_data_discriminator() {
        let data = vec![
            CallValue::from(json!({"path": "/tmp/in.wav", "meta": {"_type": FILE_DATA_TYPE}})),
            CallValue::from(json!({"path": "x", "url": "http://host/x", "meta": {"_type": FILE_DATA_TYPE}})),
            CallValue::from(json!({"path": "/tmp/plain.txt"})),
        ];
        let prepared = walk_and_store_blobs(&data, &[]);
        assert_eq!(prepared.blobs.len(), 1);
        assert_eq!(
            prepared.blobs[0].blob,
            Some(BinaryHandle::Path(PathBuf::from("/tmp/in.wav")))
        );
        assert_eq!(prepared.data[0], Value::Null);
        assert_eq!(prepared.data[2], json!({"path": "/tmp/plain.txt"}));
    }

    #[test]
    fn test_removed_file_recorded_without_blob() {
        let prepared = walk_and_store_blobs(&[CallValue::Blob(None)], &[]);
        assert_eq!(prepared.blobs.len(), 1);
        assert_eq!(prepared.blobs[0].blob, None);
        assert_eq!(prepared.data, vec![Value::Null]);
    }

    #[test]
    fn test_file_reference_shapes() {
        let blob = BlobRef {
            path: vec![PathSegment::Index(0)],
            blob: Some(BinaryHandle::named(vec![1u8], "cat.png")),
            kind: Some("image".into()),
        };
        assert_eq!(
            file_reference("/tmp/abc/cat.png", &blob),
            json!({"path": "/tmp/abc/cat.png", "meta": {"_type": FILE_DATA_TYPE}, "orig_name": "cat.png"})
        );

        let gallery = BlobRef {
            kind: Some(GALLERY_COMPONENT.into()),
            ..blob
        };
        assert_eq!(file_reference("/tmp/abc/cat.png", &gallery), json!("/tmp/abc/cat.png"));
    }

    #[test]
    fn test_update_object() {
        let mut data = vec![json!("a"), json!([0, {"image": null}])];
        update_object(
            &mut data,
            json!("handle"),
            &[PathSegment::Index(1), PathSegment::Index(1), PathSegment::Key("image".into())],
        )
        .unwrap();
        assert_eq!(data[1], json!([0, {"image": "handle"}]));

        update_object(&mut data, json!("root"), &[PathSegment::Index(0)]).unwrap();
        assert_eq!(data[0], json!("root"));
    }

    #[test]
    fn test_update_object_invalid_path() {
        let mut data = vec![json!(5)];
        let err = update_object(&mut data, json!(1), &[PathSegment::Index(0), PathSegment::Index(2)])
            .unwrap_err();
        assert_eq!(err, PayloadError::InvalidPath("0/2".into()));
        assert_eq!(update_object(&mut data, json!(1), &[]), Err(PayloadError::EmptyPath));
    }
}
