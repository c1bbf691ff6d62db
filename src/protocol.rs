//! Wire protocol variants spoken by the compute server.
//!
//! The app config names one protocol for the whole app. Each variant changes
//! how a call is submitted and how its results come back:
//!
//! ```text
//! ws        one socket per call, handshake driven by the server
//! sse       one event stream per call, payload POSTed on request
//! sse_v1    shared event stream, payload POSTed up front
//! sse_v2    sse_v1 + generator outputs arrive as diffs
//! sse_v2.1  same as sse_v2
//! sse_v3    sse_v2 + the stream stays open until `close_stream`
//! ```

pub mod compat;
pub mod message;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    #[default]
    Ws,
    Sse,
    SseV1,
    SseV2,
    SseV2_1,
    SseV3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Sse => "sse",
            Protocol::SseV1 => "sse_v1",
            Protocol::SseV2 => "sse_v2",
            Protocol::SseV2_1 => "sse_v2.1",
            Protocol::SseV3 => "sse_v3",
        }
    }

    /// Whether calls share one event stream per client.
    pub fn is_multiplexed(&self) -> bool {
        matches!(
            self,
            Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3
        )
    }

    /// Whether generator outputs arrive as diffs against the previous output.
    pub fn sends_diffs(&self) -> bool {
        matches!(self, Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3)
    }

    /// Whether the shared stream closes once every call on it has completed.
    ///
    /// `sse_v3` waits for an explicit `close_stream` frame instead.
    pub fn closes_on_completion(&self) -> bool {
        matches!(
            self,
            Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ws" => Ok(Protocol::Ws),
            "sse" => Ok(Protocol::Sse),
            "sse_v1" => Ok(Protocol::SseV1),
            "sse_v2" => Ok(Protocol::SseV2),
            "sse_v2.1" => Ok(Protocol::SseV2_1),
            "sse_v3" => Ok(Protocol::SseV3),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = UnknownProtocol;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}
