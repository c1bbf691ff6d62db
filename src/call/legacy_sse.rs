//! `sse` lifecycle: a dedicated event stream per call.
//!
//! The stream is opened with the call's `fn_index` and session hash. When
//! the server sends `send_data` it names the event id, and the payload is
//! POSTed to `queue/data` under that id.

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{CallContext, Emitter, QueueTracker};
use crate::config::{append_url_params, LEGACY_SSE_DATA_URL, SSE_DATA_URL};
use crate::models::{Status, BROKEN_CONNECTION_MSG, UNEXPECTED_ERROR_MSG};
use crate::protocol::message::{classify, parse_frame, MessageKind};
use crate::transport::post_data;

pub(super) async fn run(ctx: &CallContext, emitter: &mut Emitter) {
    emitter.status(Status::pending(true));

    let mut url = match ctx.config.endpoint_url(SSE_DATA_URL) {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid queue url for {}: {}", ctx.config.root, e);
            emitter.error(UNEXPECTED_ERROR_MSG, true);
            return;
        }
    };
    append_url_params(&mut url, ctx.options.url_params.as_deref());
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("fn_index", &ctx.fn_index.to_string());
        query.append_pair("session_hash", &ctx.session_hash);
        if let Some(jwt) = ctx.options.jwt.as_deref() {
            query.append_pair("__sign", jwt);
        }
    }

    let mut events = match ctx.transport.open_event_stream(&url, ctx.token()).await {
        Ok(events) => events,
        Err(e) => {
            warn!("Could not open event stream for {}: {}", ctx.endpoint, e);
            emitter.status(Status::broken(true));
            return;
        }
    };

    let mut tracker = QueueTracker::default();
    let mut cancelled = ctx.control.subscribe();
    loop {
        let item = tokio::select! {
            item = events.next() => item,
            _ = cancelled.changed() => break,
        };
        let raw = match item {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                warn!("Event stream for {} errored: {}", ctx.endpoint, e);
                break;
            }
            None => break,
        };

        let frame = match parse_frame(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Unexpected client exception for {}: {}", ctx.endpoint, e);
                emitter.error(UNEXPECTED_ERROR_MSG, true);
                break;
            }
        };
        let classified = match classify(&frame, emitter.last_stage()) {
            Ok(classified) => classified,
            Err(e) => {
                error!("Unexpected client exception for {}: {}", ctx.endpoint, e);
                emitter.error(UNEXPECTED_ERROR_MSG, true);
                break;
            }
        };

        if classified.kind == MessageKind::Data {
            let Some(event_id) = frame.get("event_id").and_then(Value::as_str) else {
                error!("send_data for {} carried no event_id", ctx.endpoint);
                emitter.error(UNEXPECTED_ERROR_MSG, true);
                break;
            };
            if !ctx.control.set_event_id(event_id) {
                ctx.control.notify_server().await;
                break;
            }
            if !send_payload(ctx, event_id).await {
                emitter.error(BROKEN_CONNECTION_MSG, true);
                break;
            }
            continue;
        }

        if tracker.apply(emitter, classified, ctx.render_sink.as_ref()) {
            break;
        }
    }

    if !emitter.is_finished() && !ctx.control.is_cancelled() {
        emitter.status(Status::broken(true));
    }
}

async fn send_payload(ctx: &CallContext, event_id: &str) -> bool {
    let mut url = match ctx.config.endpoint_url(LEGACY_SSE_DATA_URL) {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid data url for {}: {}", ctx.config.root, e);
            return false;
        }
    };
    append_url_params(&mut url, ctx.options.url_params.as_deref());

    let mut body = ctx.body();
    body["event_id"] = Value::String(event_id.to_string());
    let (_, status) = post_data(ctx.transport.as_ref(), &url, &body, ctx.token()).await;
    if status != 200 {
        warn!("Payload delivery for {} returned status {}", event_id, status);
        return false;
    }
    debug!("Delivered payload for {}", event_id);
    true
}
