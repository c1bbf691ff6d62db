//! Queue-less execution: one POST, one reply.

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error};

use super::{CallContext, Emitter};
use crate::config::append_url_params;
use crate::models::{Stage, Status, UNEXPECTED_ERROR_MSG};
use crate::protocol::message::error_text;
use crate::transport::post_data;

pub(super) async fn run(ctx: &CallContext, emitter: &mut Emitter) {
    emitter.status(Status::pending(false));

    let mut url = match ctx.config.run_url(&ctx.endpoint) {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid run url for {}: {}", ctx.endpoint, e);
            emitter.error(UNEXPECTED_ERROR_MSG, false);
            return;
        }
    };
    append_url_params(&mut url, ctx.options.url_params.as_deref());

    let started = Instant::now();
    let (output, status) = post_data(ctx.transport.as_ref(), &url, &ctx.body(), ctx.token()).await;
    if status != 200 {
        let message = output
            .get("error")
            .map(error_text)
            .unwrap_or_else(|| format!("Request failed with status {}", status));
        debug!("Direct call to {} failed ({}): {}", ctx.endpoint, status, message);
        emitter.error(&message, false);
        return;
    }

    emitter.data(output.get("data").cloned().unwrap_or(Value::Null));
    let eta = output
        .get("average_duration")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| started.elapsed().as_secs_f64());
    emitter.status(Status {
        eta: Some(eta),
        success: Some(true),
        ..Status::new(Stage::Complete, false)
    });
}
