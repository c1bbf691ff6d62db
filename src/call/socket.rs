//! `ws` lifecycle: one duplex socket per call.
//!
//! ```text
//! client                          server
//!   | ---- open queue/join --------> |
//!   | <--- send_hash --------------- |
//!   | ---- {fn_index, session_hash}->|
//!   | <--- estimation / starts ----- |
//!   | <--- send_data --------------- |
//!   | ---- payload ----------------> |
//!   | <--- process_* --------------- |
//! ```

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, error, warn};

use super::{CallContext, Emitter, QueueTracker};
use crate::config::{append_url_params, WS_URL};
use crate::models::{Status, UNEXPECTED_ERROR_MSG};
use crate::protocol::message::{classify, parse_frame, MessageKind};
use crate::transport::SocketMessage;

pub(super) async fn run(ctx: &CallContext, emitter: &mut Emitter, hash_on_open: bool) {
    emitter.status(Status::pending(true));

    let mut url = match ctx.config.socket_url(WS_URL) {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid socket url for {}: {}", ctx.config.root, e);
            emitter.error(UNEXPECTED_ERROR_MSG, true);
            return;
        }
    };
    append_url_params(&mut url, ctx.options.url_params.as_deref());
    if let Some(jwt) = ctx.options.jwt.as_deref() {
        url.query_pairs_mut().append_pair("__sign", jwt);
    }

    let mut socket = match ctx.transport.open_socket(&url).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Could not open socket {}: {}", url, e);
            emitter.status(Status::broken(true));
            return;
        }
    };
    if !ctx.control.attach_socket(socket.outgoing.clone()) {
        socket.close();
        return;
    }
    if hash_on_open {
        socket.send_json(&json!({"hash": ctx.session_hash}));
    }

    let mut tracker = QueueTracker::default();
    let mut cancelled = ctx.control.subscribe();
    loop {
        let message = tokio::select! {
            message = socket.incoming.next() => message,
            _ = cancelled.changed() => break,
        };
        let raw = match message {
            Some(Ok(SocketMessage::Text(raw))) => raw,
            Some(Ok(SocketMessage::Closed { clean })) => {
                debug!("Socket for {} closed (clean: {})", ctx.endpoint, clean);
                break;
            }
            Some(Err(e)) => {
                warn!("Socket for {} errored: {}", ctx.endpoint, e);
                break;
            }
            None => break,
        };

        let classified = match parse_frame(&raw).and_then(|frame| classify(&frame, emitter.last_stage())) {
            Ok(classified) => classified,
            Err(e) => {
                error!("Unexpected client exception for {}: {}", ctx.endpoint, e);
                emitter.error(UNEXPECTED_ERROR_MSG, true);
                break;
            }
        };
        match classified.kind {
            MessageKind::Hash => {
                socket.send_json(&json!({"fn_index": ctx.fn_index, "session_hash": ctx.session_hash}));
            }
            MessageKind::Data => {
                socket.send_json(&ctx.body());
            }
            _ => {
                if tracker.apply(emitter, classified, ctx.render_sink.as_ref()) {
                    break;
                }
            }
        }
    }

    if !emitter.is_finished() && !ctx.control.is_cancelled() {
        emitter.status(Status::broken(true));
    }
    socket.close();
}
