//! Network seam between call lifecycles and the compute server.
//!
//! Everything the client sends or receives goes through the [`Transport`]
//! trait, so the protocol state machines can be driven by scripted
//! transports in tests and by [`ReqwestTransport`] in production.

mod reqwest_transport;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::models::BROKEN_CONNECTION_MSG;

pub use reqwest_transport::ReqwestTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The server could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The request was sent but its response could not be read.
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Socket error: {0}")]
    Socket(String),
}

/// Status and raw body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One file of a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    pub name: String,
    pub mime: Option<String>,
    pub data: Bytes,
}

/// Data payloads of a server-sent event stream, one item per event.
pub type EventStream = BoxStream<'static, Result<String, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    /// The server closed the socket. `clean` is false for abnormal closes.
    Closed { clean: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(String),
    Close,
}

/// An open duplex socket.
pub struct SocketConnection {
    pub outgoing: mpsc::UnboundedSender<SocketCommand>,
    pub incoming: BoxStream<'static, Result<SocketMessage, TransportError>>,
}

impl SocketConnection {
    /// Queue a JSON message. Returns false once the writer has gone away.
    pub fn send_json(&self, message: &Value) -> bool {
        self.outgoing
            .send(SocketCommand::Send(message.to_string()))
            .is_ok()
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(SocketCommand::Close);
    }
}

/// Network operations the client needs.
///
/// Implementations must be cheap to share across tasks. Bearer tokens, when
/// given, are sent as `Authorization: Bearer <token>`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url, token: Option<&str>) -> Result<HttpReply, TransportError>;

    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError>;

    /// POST a multipart form with every file under the `files` field.
    async fn post_files(
        &self,
        url: &Url,
        files: Vec<FilePart>,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError>;

    async fn open_event_stream(
        &self,
        url: &Url,
        token: Option<&str>,
    ) -> Result<EventStream, TransportError>;

    async fn open_socket(&self, url: &Url) -> Result<SocketConnection, TransportError>;
}

/// POST `body` and decode the JSON reply.
///
/// Never fails: a transport failure becomes `({"error": BROKEN_CONNECTION_MSG}, 500)`
/// and an undecodable body becomes an error object with the reply's status.
pub async fn post_data(
    transport: &dyn Transport,
    url: &Url,
    body: &Value,
    token: Option<&str>,
) -> (Value, u16) {
    match transport.post_json(url, body, token).await {
        Ok(reply) => match serde_json::from_str::<Value>(&reply.body) {
            Ok(value) => (value, reply.status),
            Err(e) => {
                warn!("Could not parse response from {}: {}", url, e);
                (
                    json!({"error": format!("Could not parse server response: {}", e)}),
                    reply.status,
                )
            }
        },
        Err(e) => {
            warn!("POST {} failed: {}", url, e);
            (json!({"error": BROKEN_CONNECTION_MSG}), 500)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_post_data_decodes_json() {
        let mock = MockTransport::new();
        mock.reply("/queue/join", 200, r#"{"event_id": "abc"}"#);
        let url = Url::parse("http://localhost:7860/queue/join").unwrap();

        let (body, status) = post_data(mock.as_ref(), &url, &json!({}), None).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"event_id": "abc"}));
    }

    #[tokio::test]
    async fn test_post_data_transport_failure() {
        let mock = MockTransport::new();
        mock.fail("/queue/join");
        let url = Url::parse("http://localhost:7860/queue/join").unwrap();

        let (body, status) = post_data(mock.as_ref(), &url, &json!({}), None).await;
        assert_eq!(status, 500);
        assert_eq!(body, json!({"error": BROKEN_CONNECTION_MSG}));
    }

    #[tokio::test]
    async fn test_post_data_malformed_body() {
        let mock = MockTransport::new();
        mock.reply("/run/predict", 502, "<html>Bad Gateway</html>");
        let url = Url::parse("http://localhost:7860/run/predict").unwrap();

        let (body, status) = post_data(mock.as_ref(), &url, &json!({}), None).await;
        assert_eq!(status, 502);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Could not parse server response"));
    }

    #[test]
    fn test_reply_success_range() {
        assert!(HttpReply { status: 204, body: String::new() }.is_success());
        assert!(!HttpReply { status: 503, body: String::new() }.is_success());
    }
}
