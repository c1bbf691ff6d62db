//! Data models for queued endpoint calls.
//!
//! These structs mirror the JSON shapes exchanged with the compute server and
//! the events surfaced to callers. They use serde for (de)serialization so
//! events can be logged or forwarded verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::payload::CallValue;

/// Status message used when a connection drops or a submission fails in transit.
pub const BROKEN_CONNECTION_MSG: &str = "Connection errored out.";

/// Status message used when the server rejects a submission with HTTP 503.
pub const QUEUE_FULL_MSG: &str = "This application is too busy. Keep trying!";

/// Status message used for client-side failures while handling a frame.
pub const UNEXPECTED_ERROR_MSG: &str = "An Unexpected Error Occurred!";

// =============================================================================
// Requests
// =============================================================================

/// Reference to an invokable endpoint, by api name or by dependency index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRef {
    Index(usize),
    Name(String),
}

impl EndpointRef {
    /// Endpoint label carried by every event of a call.
    ///
    /// Numeric references are reported as `/predict`.
    pub fn label(&self) -> String {
        match self {
            EndpointRef::Index(_) => "/predict".to_string(),
            EndpointRef::Name(name) => name.clone(),
        }
    }
}

impl From<usize> for EndpointRef {
    fn from(index: usize) -> Self {
        EndpointRef::Index(index)
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        EndpointRef::Name(name.to_string())
    }
}

impl From<String> for EndpointRef {
    fn from(name: String) -> Self {
        EndpointRef::Name(name)
    }
}

/// A request to invoke one endpoint. Immutable once submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub endpoint: EndpointRef,
    pub data: Vec<CallValue>,
    pub event_data: Option<Value>,
    pub trigger_id: Option<u64>,
}

impl CallRequest {
    pub fn new(endpoint: impl Into<EndpointRef>, data: Vec<CallValue>) -> Self {
        Self {
            endpoint: endpoint.into(),
            data,
            event_data: None,
            trigger_id: None,
        }
    }

    pub fn with_event_data(mut self, event_data: Value) -> Self {
        self.event_data = Some(event_data);
        self
    }

    pub fn with_trigger_id(mut self, trigger_id: u64) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }
}

/// The body sent to the server once every attachment has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<Value>,
    pub event_data: Option<Value>,
    pub fn_index: usize,
    pub trigger_id: Option<u64>,
}

impl Payload {
    /// Payload body with the session hash merged in, as every queue endpoint expects.
    pub fn with_session(&self, session_hash: &str) -> Value {
        json!({
            "data": self.data,
            "event_data": self.event_data,
            "fn_index": self.fn_index,
            "trigger_id": self.trigger_id,
            "session_hash": session_hash,
        })
    }
}

// =============================================================================
// Value paths
// =============================================================================

/// One step of an address inside a JSON tree: a list index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    /// Interpret the segment as a list index. Numeric keys are accepted.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(key) => key.parse().ok(),
        }
    }

    /// Interpret the segment as an object key. Indices become their decimal form.
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Index(index) => index.to_string(),
            PathSegment::Key(key) => key.clone(),
        }
    }

    /// Borrow the child this segment addresses inside `container`.
    pub fn child_mut<'a>(&self, container: &'a mut Value) -> Option<&'a mut Value> {
        match container {
            Value::Array(items) => items.get_mut(self.as_index()?),
            Value::Object(map) => map.get_mut(&self.as_key()),
            _ => None,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{}", index),
            PathSegment::Key(key) => write!(f, "{}", key),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

/// Render a path as `a/0/b` for log and error messages.
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(PathSegment::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle stage of a call.
///
/// A call moves `Pending -> Generating* -> Complete | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Generating,
    Complete,
    Error,
}

impl Stage {
    /// Whether no further events may follow this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Generating => "generating",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }
}

/// Progress report for one tracked loop on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUnit {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub desc: Option<String>,
}

/// Queue and execution status of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub stage: Stage,
    /// Whether the call went through the server queue.
    pub queue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u64>,
    /// Estimated seconds until completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_data: Option<Vec<ProgressUnit>>,
    /// Set when the error was caused by a lost connection.
    #[serde(default)]
    pub broken: bool,
}

impl Status {
    pub fn new(stage: Stage, queue: bool) -> Self {
        Self {
            stage,
            queue,
            message: None,
            code: None,
            queue_position: None,
            queue_size: None,
            eta: None,
            success: None,
            progress_data: None,
            broken: false,
        }
    }

    pub fn pending(queue: bool) -> Self {
        Self::new(Stage::Pending, queue)
    }

    pub fn error(message: impl Into<String>, queue: bool) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(Stage::Error, queue)
        }
    }

    /// Terminal error for a connection that dropped underneath the call.
    pub fn broken(queue: bool) -> Self {
        Self {
            broken: true,
            ..Self::error(BROKEN_CONNECTION_MSG, queue)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataEvent {
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
    pub data: Value,
    pub event_data: Option<Value>,
    pub trigger_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
    pub log: String,
    pub level: String,
}

/// Structural change to the set of invokable endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderEvent {
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
    pub render_config: Value,
}

/// Event surfaced to the consumer of a call, whatever protocol carried it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    Status(StatusEvent),
    Data(DataEvent),
    Log(LogEvent),
    Render(RenderEvent),
}

impl CallEvent {
    pub fn endpoint(&self) -> &str {
        match self {
            CallEvent::Status(e) => &e.endpoint,
            CallEvent::Data(e) => &e.endpoint,
            CallEvent::Log(e) => &e.endpoint,
            CallEvent::Render(e) => &e.endpoint,
        }
    }

    pub fn fn_index(&self) -> usize {
        match self {
            CallEvent::Status(e) => e.fn_index,
            CallEvent::Data(e) => e.fn_index,
            CallEvent::Log(e) => e.fn_index,
            CallEvent::Render(e) => e.fn_index,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            CallEvent::Status(e) => e.time,
            CallEvent::Data(e) => e.time,
            CallEvent::Log(e) => e.time,
            CallEvent::Render(e) => e.time,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            CallEvent::Status(e) => Some(&e.status),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            CallEvent::Data(e) => Some(&e.data),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(Status::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_terminal() {
        assert!(!Stage::Pending.is_terminal());
        assert!(!Stage::Generating.is_terminal());
        assert!(Stage::Complete.is_terminal());
        assert!(Stage::Error.is_terminal());
    }

    #[test]
    fn test_endpoint_label() {
        assert_eq!(EndpointRef::from(3).label(), "/predict");
        assert_eq!(EndpointRef::from("/translate").label(), "/translate");
    }

    #[test]
    fn test_path_segment_coercion() {
        assert_eq!(PathSegment::Key("2".into()).as_index(), Some(2));
        assert_eq!(PathSegment::Key("name".into()).as_index(), None);
        assert_eq!(PathSegment::Index(7).as_key(), "7");

        let segments: Vec<PathSegment> = serde_json::from_value(json!([0, "a", 3])).unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Index(0),
                PathSegment::Key("a".into()),
                PathSegment::Index(3)
            ]
        );
        assert_eq!(display_path(&segments), "0/a/3");
    }

    #[test]
    fn test_child_mut_on_list_and_object() {
        let mut value = json!({"items": [1, 2, 3]});
        let items = PathSegment::from("items").child_mut(&mut value).unwrap();
        *PathSegment::Index(1).child_mut(items).unwrap() = json!(20);
        assert_eq!(value, json!({"items": [1, 20, 3]}));

        let mut scalar = json!(5);
        assert!(PathSegment::Index(0).child_mut(&mut scalar).is_none());
    }

    #[test]
    fn test_payload_with_session() {
        let payload = Payload {
            data: vec![json!("hi")],
            event_data: None,
            fn_index: 2,
            trigger_id: Some(9),
        };
        assert_eq!(
            payload.with_session("abc"),
            json!({
                "data": ["hi"],
                "event_data": null,
                "fn_index": 2,
                "trigger_id": 9,
                "session_hash": "abc"
            })
        );
    }

    #[test]
    fn test_broken_status() {
        let status = Status::broken(true);
        assert_eq!(status.stage, Stage::Error);
        assert!(status.broken);
        assert_eq!(status.message.as_deref(), Some(BROKEN_CONNECTION_MSG));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CallEvent::Status(StatusEvent {
            endpoint: "/predict".into(),
            fn_index: 0,
            time: Utc::now(),
            status: Status::pending(true),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["stage"], "pending");
        assert_eq!(json["queue"], true);
        assert!(!event.is_terminal());
    }
}
