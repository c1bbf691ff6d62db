//! Shared event stream multiplexer.
//!
//! On the multiplexed protocols every call of a client listens on one event
//! stream. The multiplexer owns that stream and routes each frame to the
//! call that registered its `event_id`:
//!
//! ```text
//!                       +--> handler "a1" (call A)
//! GET queue/data ---> dispatch --> handler "b2" (call B)
//!                       +--> pending["c3"] (no handler yet)
//! ```
//!
//! A server may emit frames for an event before the submitting call has
//! seen the id in its POST reply. Those frames are buffered and replayed in
//! arrival order when the handler registers. Registration and replay happen
//! under one lock so a frame can never slip in between them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::diff::{apply_diff_stream, DiffError};
use crate::protocol::message::{parse_frame, BROKEN_CONNECTION, CLOSE_STREAM, PROCESS_COMPLETED};
use crate::protocol::Protocol;
use crate::transport::Transport;

/// Finished event ids remembered so their late frames are dropped, not buffered.
const RETIRED_EVENT_CAPACITY: usize = 256;

/// Per-call frame handler. Delivery never blocks the reader.
pub type FrameSender = mpsc::UnboundedSender<Value>;

/// Routing tables of the shared stream.
#[derive(Debug, Default)]
struct StreamState {
    open: bool,
    /// Bumped on every open and close so a stale reader can tell it was replaced.
    generation: u64,
    event_callbacks: HashMap<String, FrameSender>,
    unclosed_events: HashSet<String>,
    pending_stream_messages: HashMap<String, Vec<Value>>,
    pending_diff_streams: HashMap<String, Vec<Value>>,
    retired_events: VecDeque<String>,
}

impl StreamState {
    fn retire(&mut self, event_id: &str) {
        if self.retired_events.iter().any(|id| id == event_id) {
            return;
        }
        if self.retired_events.len() == RETIRED_EVENT_CAPACITY {
            self.retired_events.pop_front();
        }
        self.retired_events.push_back(event_id.to_string());
    }

    fn is_retired(&self, event_id: &str) -> bool {
        self.retired_events.iter().any(|id| id == event_id)
    }

    /// Mark the stream closed and invalidate the current reader.
    fn mark_closed(&mut self) {
        self.open = false;
        self.generation += 1;
    }
}

/// One shared event stream per client.
pub struct StreamMultiplexer {
    transport: Arc<dyn Transport>,
    protocol: Protocol,
    url: Url,
    token: Option<String>,
    state: Mutex<StreamState>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamMultiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        protocol: Protocol,
        url: Url,
        token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            protocol,
            url,
            token,
            state: Mutex::new(StreamState::default()),
            reader: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn has_handler(&self, event_id: &str) -> bool {
        self.state.lock().event_callbacks.contains_key(event_id)
    }

    pub fn has_diff_state(&self, event_id: &str) -> bool {
        self.state.lock().pending_diff_streams.contains_key(event_id)
    }

    /// Number of frames buffered for an event that has no handler yet.
    pub fn pending_count(&self, event_id: &str) -> usize {
        self.state
            .lock()
            .pending_stream_messages
            .get(event_id)
            .map_or(0, Vec::len)
    }

    /// Register the handler for `event_id`, replaying any buffered frames
    /// first, and open the stream if it is not already open.
    pub fn register(self: &Arc<Self>, event_id: &str, handler: FrameSender) {
        let open_generation = {
            let mut state = self.state.lock();
            if let Some(buffered) = state.pending_stream_messages.remove(event_id) {
                debug!("Replaying {} buffered frames for {}", buffered.len(), event_id);
                for frame in buffered {
                    let _ = handler.send(frame);
                }
            }
            state.retired_events.retain(|id| id != event_id);
            state.event_callbacks.insert(event_id.to_string(), handler);
            state.unclosed_events.insert(event_id.to_string());

            if state.open {
                None
            } else {
                state.open = true;
                state.generation += 1;
                Some(state.generation)
            }
        };

        if let Some(generation) = open_generation {
            self.spawn_reader(generation);
        }
    }

    /// Remove a finished call's handler and diff cache.
    ///
    /// On protocols that close on completion the stream is torn down once no
    /// call remains unclosed. `sse_v3` keeps it open for `close_stream`.
    pub fn release(&self, event_id: &str) {
        let close = {
            let mut state = self.state.lock();
            state.event_callbacks.remove(event_id);
            state.pending_diff_streams.remove(event_id);
            state.unclosed_events.remove(event_id);
            state.retire(event_id);
            self.protocol.closes_on_completion() && state.open && state.unclosed_events.is_empty()
        };
        if close {
            self.close_stream();
        }
    }

    /// Drop every trace of a cancelled call. Its late frames are discarded.
    pub fn retire(&self, event_id: &str) {
        let close = {
            let mut state = self.state.lock();
            state.event_callbacks.remove(event_id);
            state.pending_diff_streams.remove(event_id);
            state.pending_stream_messages.remove(event_id);
            state.unclosed_events.remove(event_id);
            state.retire(event_id);
            state.open && state.event_callbacks.is_empty()
        };
        if close {
            debug!("Last call on {} retired, closing stream", self.url);
            self.close_stream();
        }
    }

    /// Close the stream when no call is registered on it.
    pub fn close_if_idle(&self) {
        let idle = {
            let state = self.state.lock();
            state.open && state.event_callbacks.is_empty()
        };
        if idle {
            self.close_stream();
        }
    }

    /// Reconstruct a diffed generator output in place.
    pub fn apply_diff(&self, event_id: &str, output: &mut Value) -> Result<(), DiffError> {
        let mut state = self.state.lock();
        apply_diff_stream(&mut state.pending_diff_streams, event_id, output)
    }

    /// Stop the reader. Registered handlers are kept.
    pub fn close_stream(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.open;
            state.mark_closed();
            was_open
        };
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if was_open {
            info!("Closed event stream {}", self.url);
        }
    }

    /// Close the stream and forget every call. Calls still registered
    /// receive a broken-connection frame.
    pub fn shutdown(&self) {
        self.close_stream();
        let handlers: Vec<FrameSender> = {
            let mut state = self.state.lock();
            state.unclosed_events.clear();
            state.pending_stream_messages.clear();
            state.pending_diff_streams.clear();
            state.retired_events.clear();
            state.event_callbacks.drain().map(|(_, handler)| handler).collect()
        };
        let frame = json!({"msg": BROKEN_CONNECTION});
        for handler in handlers {
            let _ = handler.send(frame.clone());
        }
    }

    /// Route one decoded frame.
    pub fn dispatch(&self, frame: Value) {
        let msg = frame.get("msg").and_then(Value::as_str).unwrap_or_default();
        if msg == CLOSE_STREAM {
            debug!("Server requested close of {}", self.url);
            self.close_stream();
            return;
        }
        let completed = msg == PROCESS_COMPLETED;

        let Some(event_id) = frame.get("event_id").and_then(Value::as_str).map(str::to_owned) else {
            self.broadcast(&frame);
            return;
        };

        let close = {
            let mut state = self.state.lock();
            if let Some(handler) = state.event_callbacks.get(&event_id).cloned() {
                let mut close = false;
                if completed && self.protocol.closes_on_completion() {
                    state.unclosed_events.remove(&event_id);
                    close = state.unclosed_events.is_empty();
                }
                if handler.send(frame).is_err() {
                    debug!("Handler for {} is gone, retiring", event_id);
                    state.event_callbacks.remove(&event_id);
                    state.retire(&event_id);
                }
                close
            } else if state.is_retired(&event_id) {
                debug!("Dropping frame for finished event {}", event_id);
                false
            } else {
                state
                    .pending_stream_messages
                    .entry(event_id)
                    .or_default()
                    .push(frame);
                false
            }
        };

        if close {
            self.close_stream();
        }
    }

    fn broadcast(&self, frame: &Value) {
        let handlers: Vec<FrameSender> = self.state.lock().event_callbacks.values().cloned().collect();
        for handler in handlers {
            let _ = handler.send(frame.clone());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.open && state.generation == generation
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        let reader = tokio::spawn(async move { this.read_loop(generation).await });
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, generation: u64) {
        info!("Opening event stream {}", self.url);
        let mut events = match self
            .transport
            .open_event_stream(&self.url, self.token.as_deref())
            .await
        {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to open event stream {}: {}", self.url, e);
                self.fail(generation);
                return;
            }
        };
        // Closed (or reopened) while the request was in flight.
        if !self.is_current(generation) {
            debug!("Dropping stale event stream {}", self.url);
            return;
        }

        while let Some(item) = events.next().await {
            if !self.is_current(generation) {
                return;
            }
            match item {
                Ok(raw) => match parse_frame(&raw) {
                    Ok(frame) => self.dispatch(frame),
                    Err(e) => warn!("Dropping malformed frame on {}: {}", self.url, e),
                },
                Err(e) => {
                    error!("Event stream {} errored: {}", self.url, e);
                    self.fail(generation);
                    return;
                }
            }
        }

        debug!("Event stream {} ended", self.url);
        self.fail(generation);
    }

    /// Mark a dropped stream closed and tell every waiting call.
    fn fail(&self, generation: u64) {
        let handlers: Vec<FrameSender> = {
            let mut state = self.state.lock();
            if state.generation != generation || !state.open {
                return;
            }
            state.mark_closed();
            state.event_callbacks.values().cloned().collect()
        };
        self.reader.lock().take();
        if !handlers.is_empty() {
            warn!("Event stream {} dropped with {} calls in flight", self.url, handlers.len());
        }
        let frame = json!({"msg": BROKEN_CONNECTION});
        for handler in handlers {
            let _ = handler.send(frame.clone());
        }
    }
}
