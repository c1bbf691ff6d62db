//! Scripted transport for tests.
//!
//! HTTP replies are queued per path suffix and fall back to `200 {}`.
//! Event streams and sockets are handed out in the order they were
//! scripted, each backed by a channel the test keeps the other end of.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{
    EventStream, FilePart, HttpReply, SocketCommand, SocketConnection, SocketMessage, Transport,
    TransportError,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedRequest {
    pub method: &'static str,
    pub url: Url,
    pub body: Option<Value>,
    pub files: Vec<FilePart>,
    pub token: Option<String>,
}

type ServerFrames = mpsc::UnboundedSender<Result<String, TransportError>>;

/// Test side of a scripted socket.
pub(crate) struct MockSocket {
    server: mpsc::UnboundedSender<Result<SocketMessage, TransportError>>,
    client: mpsc::UnboundedReceiver<SocketCommand>,
}

impl MockSocket {
    /// Deliver a JSON frame to the client.
    pub fn push(&self, frame: Value) {
        let _ = self.server.send(Ok(SocketMessage::Text(frame.to_string())));
    }

    pub fn close(&self, clean: bool) {
        let _ = self.server.send(Ok(SocketMessage::Closed { clean }));
    }

    /// Next command the client issued, or `None` once the client side is gone.
    pub async fn next_command(&mut self) -> Option<SocketCommand> {
        self.client.recv().await
    }

    /// Next message the client sent, decoded as JSON.
    pub async fn next_json(&mut self) -> Option<Value> {
        match self.client.recv().await? {
            SocketCommand::Send(text) => serde_json::from_str(&text).ok(),
            SocketCommand::Close => None,
        }
    }
}

type ScriptedSocket = (
    mpsc::UnboundedReceiver<Result<SocketMessage, TransportError>>,
    mpsc::UnboundedSender<SocketCommand>,
);

#[derive(Default)]
pub(crate) struct MockTransport {
    replies: Mutex<HashMap<String, VecDeque<Result<HttpReply, TransportError>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<String, TransportError>>>>,
    sockets: Mutex<VecDeque<ScriptedSocket>>,
    opened_streams: Mutex<Vec<Url>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply for the next request whose path ends with `path`.
    pub fn reply(&self, path: &str, status: u16, body: &str) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(Ok(HttpReply {
                status,
                body: body.to_string(),
            }));
    }

    /// Fail the next request whose path ends with `path`.
    pub fn fail(&self, path: &str) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(Err(TransportError::Connection("connection refused".into())));
    }

    /// Script the next event stream. Frames sent before it is opened are buffered.
    pub fn event_stream(&self) -> ServerFrames {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push_back(rx);
        tx
    }

    /// Script the next socket.
    pub fn socket(&self) -> MockSocket {
        let (server, incoming) = mpsc::unbounded_channel();
        let (outgoing, client) = mpsc::unbounded_channel();
        self.sockets.lock().push_back((incoming, outgoing));
        MockSocket { server, client }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Recorded requests whose path ends with `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url.path().ends_with(path))
            .cloned()
            .collect()
    }

    pub fn opened_streams(&self) -> Vec<Url> {
        self.opened_streams.lock().clone()
    }

    fn record(&self, method: &'static str, url: &Url, body: Option<Value>, files: Vec<FilePart>, token: Option<&str>) {
        self.requests.lock().push(RecordedRequest {
            method,
            url: url.clone(),
            body,
            files,
            token: token.map(str::to_string),
        });
    }

    fn next_reply(&self, url: &Url) -> Result<HttpReply, TransportError> {
        let mut replies = self.replies.lock();
        let scripted = replies
            .iter_mut()
            .filter(|(path, _)| url.path().ends_with(path.as_str()))
            .find_map(|(_, queue)| queue.pop_front());
        scripted.unwrap_or_else(|| {
            Ok(HttpReply {
                status: 200,
                body: "{}".to_string(),
            })
        })
    }
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &Url, token: Option<&str>) -> Result<HttpReply, TransportError> {
        self.record("GET", url, None, Vec::new(), token);
        self.next_reply(url)
    }

    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError> {
        self.record("POST", url, Some(body.clone()), Vec::new(), token);
        self.next_reply(url)
    }

    async fn post_files(
        &self,
        url: &Url,
        files: Vec<FilePart>,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError> {
        self.record("POST", url, None, files, token);
        self.next_reply(url)
    }

    async fn open_event_stream(
        &self,
        url: &Url,
        _token: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        self.opened_streams.lock().push(url.clone());
        let rx = self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Connection("no scripted event stream".into()))?;
        Ok(channel_stream(rx))
    }

    async fn open_socket(&self, url: &Url) -> Result<SocketConnection, TransportError> {
        self.opened_streams.lock().push(url.clone());
        let (incoming, outgoing) = self
            .sockets
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Connection("no scripted socket".into()))?;
        Ok(SocketConnection {
            outgoing,
            incoming: channel_stream(incoming),
        })
    }
}
