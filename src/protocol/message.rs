//! Classification of inbound server frames.
//!
//! Every protocol family delivers the same JSON frames keyed by `msg`. This
//! module maps a frame to a [`MessageKind`], the [`Status`] it implies and
//! the output it carries, leaving transport-specific reactions to the caller.

use serde_json::Value;
use thiserror::Error;

use crate::models::{ProgressUnit, Stage, Status, QUEUE_FULL_MSG, UNEXPECTED_ERROR_MSG};

/// Control frame that tells the client to tear down the shared stream.
pub const CLOSE_STREAM: &str = "close_stream";
/// Synthetic frame broadcast when the shared stream drops.
pub const BROKEN_CONNECTION: &str = "broken_connection";
pub const PROCESS_COMPLETED: &str = "process_completed";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is missing field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Server asks for the session hash (`ws`).
    Hash,
    /// Server asks for the payload (`ws`, `sse`).
    Data,
    /// Queue or progress update.
    Update,
    Complete,
    Generating,
    Log,
    Heartbeat,
    UnexpectedError,
    BrokenConnection,
    CloseStream,
    /// Unrecognized frame. Ignored.
    None,
}

/// A frame reduced to what the call lifecycles act on.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: MessageKind,
    pub status: Option<Status>,
    /// Output for `Generating`/`Complete`, the whole frame for `Log`.
    pub data: Option<Value>,
}

impl Classified {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            status: None,
            data: None,
        }
    }

    fn update(status: Status) -> Self {
        Self {
            kind: MessageKind::Update,
            status: Some(status),
            data: None,
        }
    }
}

pub fn parse_frame(raw: &str) -> Result<Value, FrameError> {
    Ok(serde_json::from_str(raw)?)
}

/// Classify one frame. `last_stage` is the stage most recently reported for the call.
///
/// # Errors
///
/// Returns [`FrameError::MissingField`] when a frame lacks the fields its
/// `msg` requires, such as an output on `process_completed`.
pub fn classify(frame: &Value, last_stage: Option<Stage>) -> Result<Classified, FrameError> {
    let msg = frame
        .get("msg")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField("msg"))?;
    let success = frame.get("success").and_then(Value::as_bool);
    let code = frame.get("code").and_then(code_text);

    let classified = match msg {
        "send_data" => Classified::bare(MessageKind::Data),
        "send_hash" => Classified::bare(MessageKind::Hash),
        "heartbeat" => Classified::bare(MessageKind::Heartbeat),
        CLOSE_STREAM => Classified::bare(MessageKind::CloseStream),
        BROKEN_CONNECTION => Classified {
            kind: MessageKind::BrokenConnection,
            status: Some(Status::broken(true)),
            data: None,
        },
        "queue_full" => Classified::update(Status {
            code,
            success,
            ..Status::error(QUEUE_FULL_MSG, true)
        }),
        "unexpected_error" => Classified {
            kind: MessageKind::UnexpectedError,
            status: Some(Status {
                success: Some(false),
                ..Status::error(
                    frame
                        .get("message")
                        .map(error_text)
                        .unwrap_or_else(|| UNEXPECTED_ERROR_MSG.to_string()),
                    true,
                )
            }),
            data: None,
        },
        "estimation" => Classified::update(Status {
            code,
            success,
            queue_size: frame.get("queue_size").and_then(Value::as_u64),
            queue_position: frame.get("rank").and_then(Value::as_u64),
            eta: frame.get("rank_eta").and_then(Value::as_f64),
            ..Status::new(last_stage.unwrap_or(Stage::Pending), true)
        }),
        "progress" => Classified::update(Status {
            code,
            success,
            progress_data: progress_data(frame),
            ..Status::pending(true)
        }),
        "process_starts" => Classified::update(Status {
            code,
            success,
            queue_size: frame.get("rank").and_then(Value::as_u64),
            queue_position: Some(0),
            eta: frame.get("eta").and_then(Value::as_f64),
            ..Status::pending(true)
        }),
        "log" => Classified {
            kind: MessageKind::Log,
            status: None,
            data: Some(frame.clone()),
        },
        "process_generating" | "process_streaming" => {
            let output = output(frame)?;
            // Older servers omit `success` on generator frames.
            let ok = success.unwrap_or_else(|| output_error(output).is_none());
            let stage = if ok { Stage::Generating } else { Stage::Error };
            Classified {
                kind: MessageKind::Generating,
                status: Some(Status {
                    code,
                    success,
                    message: if ok { None } else { output_error(output) },
                    progress_data: progress_data(frame),
                    eta: frame.get("average_duration").and_then(Value::as_f64),
                    ..Status::new(stage, true)
                }),
                data: ok.then(|| output.clone()),
            }
        }
        PROCESS_COMPLETED => {
            let output = output(frame)?;
            let ok = success.unwrap_or(true);
            match output.get("error") {
                Some(error) if !error.is_null() || !ok => Classified::update(Status {
                    code,
                    success,
                    ..Status::error(error_text(error), true)
                }),
                _ => Classified {
                    kind: MessageKind::Complete,
                    status: Some(Status {
                        code,
                        success,
                        progress_data: progress_data(frame),
                        eta: output.get("average_duration").and_then(Value::as_f64),
                        ..Status::new(if ok { Stage::Complete } else { Stage::Error }, true)
                    }),
                    data: ok.then(|| output.clone()),
                },
            }
        }
        _ => Classified::bare(MessageKind::None),
    };
    Ok(classified)
}

fn output(frame: &Value) -> Result<&Value, FrameError> {
    frame
        .get("output")
        .filter(|output| output.is_object())
        .ok_or(FrameError::MissingField("output"))
}

fn output_error(output: &Value) -> Option<String> {
    output
        .get("error")
        .filter(|error| !error.is_null())
        .map(error_text)
}

fn progress_data(frame: &Value) -> Option<Vec<ProgressUnit>> {
    frame
        .get("progress_data")
        .filter(|p| !p.is_null())
        .and_then(|p| serde_json::from_value(p.clone()).ok())
}

fn code_text(code: &Value) -> Option<String> {
    match code {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

/// Human-readable text of an error value. Null errors carry no message of their own.
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Null => UNEXPECTED_ERROR_MSG.to_string(),
        other => other.to_string(),
    }
}
