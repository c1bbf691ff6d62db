//! `sse_v1` and later: payload POSTed up front, results on the shared stream.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{CallContext, CallError, Emitter, QueueTracker};
use crate::config::{append_url_params, SSE_DATA_URL};
use crate::models::{Status, BROKEN_CONNECTION_MSG, QUEUE_FULL_MSG, UNEXPECTED_ERROR_MSG};
use crate::protocol::message::{classify, MessageKind};
use crate::protocol::Protocol;
use crate::transport::post_data;

pub(super) async fn run(ctx: &CallContext, emitter: &mut Emitter, protocol: Protocol) {
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

    let (response, status) = post_data(ctx.transport.as_ref(), &url, &ctx.body(), ctx.token()).await;
    if status == 503 {
        emitter.error(QUEUE_FULL_MSG, true);
        return;
    }
    if status != 200 {
        warn!("Queue join for {} returned status {}", ctx.endpoint, status);
        emitter.error(BROKEN_CONNECTION_MSG, true);
        return;
    }
    let Some(event_id) = response.get("event_id").and_then(Value::as_str).map(str::to_owned) else {
        error!("Queue join for {} returned no event_id", ctx.endpoint);
        emitter.error(UNEXPECTED_ERROR_MSG, true);
        return;
    };
    debug!("Joined queue for {} as {}", ctx.endpoint, event_id);

    if !ctx.control.set_event_id(&event_id) {
        ctx.control.notify_server().await;
        return;
    }

    let (handler, mut frames) = mpsc::unbounded_channel();
    ctx.multiplexer.register(&event_id, handler);
    if ctx.control.is_cancelled() {
        ctx.multiplexer.retire(&event_id);
        return;
    }

    let diffs = protocol.sends_diffs() && !ctx.config.is_stream_connection(ctx.fn_index);
    let mut tracker = QueueTracker::default();
    let mut cancelled = ctx.control.subscribe();
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = cancelled.changed() => break,
        };
        let Some(frame) = frame else { break };

        match handle_frame(ctx, emitter, &mut tracker, &event_id, diffs, frame) {
            Ok(false) => {}
            Ok(true) => {
                ctx.multiplexer.release(&event_id);
                break;
            }
            Err(e) => {
                error!("Unexpected client exception for {}: {}", event_id, e);
                emitter.error(UNEXPECTED_ERROR_MSG, true);
                ctx.multiplexer.release(&event_id);
                ctx.multiplexer.close_if_idle();
                break;
            }
        }
    }
}

/// Returns true once the call has reached its terminal status.
fn handle_frame(
    ctx: &CallContext,
    emitter: &mut Emitter,
    tracker: &mut QueueTracker,
    event_id: &str,
    diffs: bool,
    frame: Value,
) -> Result<bool, CallError> {
    let mut classified = classify(&frame, emitter.last_stage())?;
    if classified.kind == MessageKind::Heartbeat {
        return Ok(false);
    }
    if diffs && classified.kind == MessageKind::Generating {
        if let Some(output) = classified.data.as_mut() {
            ctx.multiplexer.apply_diff(event_id, output)?;
        }
    }
    Ok(tracker.apply(emitter, classified, ctx.render_sink.as_ref()))
}
