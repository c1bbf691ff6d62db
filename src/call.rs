//! Call lifecycles: one strategy per wire protocol family.
//!
//! A lifecycle is selected once per call from the app protocol and the
//! endpoint's queue setting:
//!
//! ```text
//! queue disabled         -> Direct       POST run/<endpoint>
//! ws                     -> Socket       one socket per call
//! sse                    -> LegacyStream one event stream per call
//! sse_v1/v2/v2.1/v3      -> Multiplexed  shared event stream
//! ```
//!
//! Every lifecycle reports through an [`Emitter`], which guarantees that no
//! event follows a terminal status, and is cancelled through a
//! [`QueueControl`].

mod direct;
mod legacy_sse;
mod multiplexed;
mod socket;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bridge::{CallControl, EventSink};
use crate::config::{AppConfig, ClientOptions, CANCEL_URL, RESET_URL};
use crate::diff::DiffError;
use crate::models::{
    CallEvent, DataEvent, LogEvent, Payload, RenderEvent, Stage, Status, StatusEvent,
};
use crate::protocol::compat;
use crate::protocol::message::{Classified, FrameError, MessageKind};
use crate::protocol::Protocol;
use crate::stream::StreamMultiplexer;
use crate::transport::{SocketCommand, Transport};

/// Receives render configurations so the caller can rebuild its endpoint view.
pub trait RenderSink: Send + Sync {
    fn render(&self, fn_index: usize, render_config: &Value);
}

/// Client-side failure while handling a frame.
#[derive(Debug, Error)]
pub(crate) enum CallError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Diff(#[from] DiffError),
}

// =============================================================================
// Lifecycle selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Queue bypassed: one POST, one reply.
    Direct,
    /// `ws`. Servers before 3.6 expect the session hash as soon as the socket opens.
    Socket { hash_on_open: bool },
    /// `sse`: a dedicated event stream, payload sent when the server asks.
    LegacyStream,
    /// `sse_v1` and later: payload POSTed up front, results on the shared stream.
    Multiplexed(Protocol),
}

impl Lifecycle {
    pub fn select(protocol: Protocol, skip_queue: bool, server_version: &str) -> Self {
        if skip_queue {
            return Lifecycle::Direct;
        }
        match protocol {
            Protocol::Ws => Lifecycle::Socket {
                hash_on_open: compat::sends_hash_on_open(server_version),
            },
            Protocol::Sse => Lifecycle::LegacyStream,
            multiplexed => Lifecycle::Multiplexed(multiplexed),
        }
    }

    pub(crate) async fn run(self, ctx: CallContext, mut emitter: Emitter) {
        match self {
            Lifecycle::Direct => direct::run(&ctx, &mut emitter).await,
            Lifecycle::Socket { hash_on_open } => {
                socket::run(&ctx, &mut emitter, hash_on_open).await
            }
            Lifecycle::LegacyStream => legacy_sse::run(&ctx, &mut emitter).await,
            Lifecycle::Multiplexed(protocol) => {
                multiplexed::run(&ctx, &mut emitter, protocol).await
            }
        }
        emitter.close();
    }
}

/// Everything a lifecycle needs to run one call.
pub(crate) struct CallContext {
    pub endpoint: String,
    pub fn_index: usize,
    pub payload: Payload,
    pub session_hash: String,
    pub config: Arc<AppConfig>,
    pub options: Arc<ClientOptions>,
    pub transport: Arc<dyn Transport>,
    pub multiplexer: Arc<StreamMultiplexer>,
    pub control: Arc<QueueControl>,
    pub render_sink: Option<Arc<dyn RenderSink>>,
}

impl CallContext {
    fn token(&self) -> Option<&str> {
        self.options.token.as_deref()
    }

    fn body(&self) -> Value {
        self.payload.with_session(&self.session_hash)
    }
}

// =============================================================================
// Event emission
// =============================================================================

/// Stamps and delivers one call's events.
pub(crate) struct Emitter {
    sink: EventSink,
    endpoint: String,
    fn_index: usize,
    event_data: Option<Value>,
    trigger_id: Option<u64>,
    last_stage: Option<Stage>,
    finished: bool,
}

impl Emitter {
    pub fn new(
        sink: EventSink,
        endpoint: String,
        fn_index: usize,
        event_data: Option<Value>,
        trigger_id: Option<u64>,
    ) -> Self {
        Self {
            sink,
            endpoint,
            fn_index,
            event_data,
            trigger_id,
            last_stage: None,
            finished: false,
        }
    }

    pub fn last_stage(&self) -> Option<Stage> {
        self.last_stage
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Emit a status. A terminal status closes the sink.
    pub fn status(&mut self, status: Status) {
        if self.finished {
            return;
        }
        self.last_stage = Some(status.stage);
        let terminal = status.is_terminal();
        self.sink.push(CallEvent::Status(StatusEvent {
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            time: Utc::now(),
            status,
        }));
        if terminal {
            self.finished = true;
            self.sink.close();
        }
    }

    /// Stop emitting. The consumer's stream ends once drained.
    pub fn close(&mut self) {
        self.finished = true;
        self.sink.close();
    }

    pub fn error(&mut self, message: &str, queue: bool) {
        self.status(Status::error(message, queue));
    }

    pub fn data(&mut self, data: Value) {
        if self.finished {
            return;
        }
        self.sink.push(CallEvent::Data(DataEvent {
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            time: Utc::now(),
            data,
            event_data: self.event_data.clone(),
            trigger_id: self.trigger_id,
        }));
    }

    pub fn log(&mut self, frame: &Value) {
        if self.finished {
            return;
        }
        self.sink.push(CallEvent::Log(LogEvent {
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            time: Utc::now(),
            log: frame
                .get("log")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            level: frame
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_string(),
        }));
    }

    pub fn render(&mut self, render_config: Value) {
        if self.finished {
            return;
        }
        self.sink.push(CallEvent::Render(RenderEvent {
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            time: Utc::now(),
            render_config,
        }));
    }

    /// Emit a frame's output, then the buffered completion status if any.
    pub fn output(
        &mut self,
        output: &Value,
        complete: Option<Status>,
        render_sink: Option<&Arc<dyn RenderSink>>,
    ) {
        self.data(output.get("data").cloned().unwrap_or(Value::Null));
        if let Some(config) = output.get("render_config").filter(|c| !c.is_null()) {
            if let Some(sink) = render_sink {
                sink.render(self.fn_index, config);
            }
            self.render(config.clone());
        }
        if let Some(status) = complete {
            self.status(status);
        }
    }
}

/// Status and output handling shared by the queued lifecycles.
#[derive(Debug, Default)]
pub(crate) struct QueueTracker {
    /// Completion status held back until its output has been emitted.
    complete: Option<Status>,
}

impl QueueTracker {
    /// Apply a classified frame. Returns true once the call is finished.
    pub fn apply(
        &mut self,
        emitter: &mut Emitter,
        classified: Classified,
        render_sink: Option<&Arc<dyn RenderSink>>,
    ) -> bool {
        let Classified { kind, status, data } = classified;
        let completing = kind == MessageKind::Complete;
        match kind {
            MessageKind::Update => {
                if let Some(status) = status.filter(|_| self.complete.is_none()) {
                    emitter.status(status);
                }
            }
            MessageKind::Complete => self.complete = status,
            MessageKind::Generating
            | MessageKind::UnexpectedError
            | MessageKind::BrokenConnection => {
                if let Some(status) = status {
                    emitter.status(status);
                }
            }
            MessageKind::Log => {
                if let Some(frame) = &data {
                    emitter.log(frame);
                }
                return emitter.is_finished();
            }
            _ => return emitter.is_finished(),
        }

        match data {
            Some(output) => emitter.output(&output, self.complete.take(), render_sink),
            // A held completion only leaves with its own frame or with data.
            None if completing => {
                if let Some(status) = self.complete.take() {
                    emitter.status(status);
                }
            }
            None => {}
        }
        emitter.is_finished()
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Protocol-specific cancellation for one call.
pub(crate) struct QueueControl {
    lifecycle: Lifecycle,
    fn_index: usize,
    session_hash: String,
    config: Arc<AppConfig>,
    token: Option<String>,
    transport: Arc<dyn Transport>,
    multiplexer: Arc<StreamMultiplexer>,
    event_id: Mutex<Option<String>>,
    socket: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
    cancelled: watch::Sender<bool>,
}

impl QueueControl {
    pub fn new(
        lifecycle: Lifecycle,
        fn_index: usize,
        session_hash: String,
        config: Arc<AppConfig>,
        token: Option<String>,
        transport: Arc<dyn Transport>,
        multiplexer: Arc<StreamMultiplexer>,
    ) -> Arc<Self> {
        let (cancelled, _) = watch::channel(false);
        Arc::new(Self {
            lifecycle,
            fn_index,
            session_hash,
            config,
            token,
            transport,
            multiplexer,
            event_id: Mutex::new(None),
            socket: Mutex::new(None),
            cancelled,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancelled.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Record the server-issued event id.
    ///
    /// Returns false when the call was cancelled before the id was known, in
    /// which case the caller owns notifying the server.
    pub fn set_event_id(&self, event_id: &str) -> bool {
        let mut slot = self.event_id.lock();
        *slot = Some(event_id.to_string());
        !self.is_cancelled()
    }

    /// Hand over the socket writer so cancellation can close it.
    ///
    /// Returns false when the call was already cancelled.
    pub fn attach_socket(&self, writer: mpsc::UnboundedSender<SocketCommand>) -> bool {
        let mut slot = self.socket.lock();
        if self.is_cancelled() {
            return false;
        }
        *slot = Some(writer);
        true
    }

    /// Best-effort server notification for an abandoned call.
    pub async fn notify_server(&self) {
        match self.lifecycle {
            Lifecycle::Direct => {
                debug!("fn_index {} was not queued, nothing to cancel", self.fn_index);
            }
            Lifecycle::Socket { .. } => {
                if let Some(socket) = self.socket.lock().take() {
                    let _ = socket.send(SocketCommand::Close);
                }
                self.post_best_effort(
                    RESET_URL,
                    json!({"fn_index": self.fn_index, "session_hash": self.session_hash}),
                )
                .await;
            }
            Lifecycle::LegacyStream | Lifecycle::Multiplexed(_) => {
                let Some(event_id) = self.event_id.lock().clone() else {
                    debug!("fn_index {} cancelled before it was queued", self.fn_index);
                    return;
                };
                if matches!(self.lifecycle, Lifecycle::Multiplexed(_)) {
                    self.multiplexer.retire(&event_id);
                }
                self.post_best_effort(
                    CANCEL_URL,
                    json!({
                        "event_id": event_id,
                        "session_hash": self.session_hash,
                        "fn_index": self.fn_index,
                    }),
                )
                .await;
                self.post_best_effort(
                    RESET_URL,
                    json!({"event_id": event_id, "session_hash": self.session_hash}),
                )
                .await;
            }
        }
    }

    async fn post_best_effort(&self, path: &str, body: Value) {
        let url = match self.config.endpoint_url(path) {
            Ok(url) => url,
            Err(e) => {
                warn!("The `/{}` endpoint could not be resolved: {}", path, e);
                return;
            }
        };
        match self.transport.post_json(&url, &body, self.token.as_deref()).await {
            Ok(reply) if reply.is_success() => debug!("POST /{} accepted", path),
            Ok(reply) => warn!("The `/{}` endpoint returned status {}", path, reply.status),
            Err(e) => warn!(
                "The `/{}` endpoint could not be called. Subsequent endpoint results may be unreliable: {}",
                path, e
            ),
        }
    }
}

#[async_trait]
impl CallControl for QueueControl {
    async fn cancel(&self) {
        let known = {
            let slot = self.event_id.lock();
            self.cancelled.send_replace(true);
            slot.is_some()
        };
        // Calls cancelled before their event id arrived are notified by the
        // lifecycle once the id is known.
        if known || !matches!(self.lifecycle, Lifecycle::LegacyStream | Lifecycle::Multiplexed(_)) {
            self.notify_server().await;
        }
    }

    fn event_id(&self) -> Option<String> {
        self.event_id.lock().clone()
    }
}
