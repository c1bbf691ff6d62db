//! queuecall - submit one call to an app and print its events.
//!
//! ```text
//! queuecall <root-url> <endpoint> [json-args]
//! ```
//!
//! `endpoint` is an api name (`/predict`) or a dependency index. Arguments
//! default to `[]`. Ctrl-C cancels the call.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuecall::{CallRequest, CallValue, Client, ClientOptions, EndpointRef};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "queuecall=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (root, endpoint) = match args.as_slice() {
        [root, endpoint, ..] => (root.as_str(), endpoint.as_str()),
        _ => bail!("usage: queuecall <root-url> <endpoint> [json-args]"),
    };
    let data = parse_args(args.get(2).map(String::as_str))?;
    let endpoint = match endpoint.parse::<usize>() {
        Ok(index) => EndpointRef::Index(index),
        Err(_) => EndpointRef::Name(endpoint.to_string()),
    };

    tracing::info!("Starting queuecall v{}", env!("CARGO_PKG_VERSION"));
    let client = Client::connect(root, ClientOptions::from_env())
        .await
        .with_context(|| format!("Failed to connect to {}", root))?;

    let mut call = client
        .submit(CallRequest::new(endpoint, data))
        .context("Failed to submit call")?;
    loop {
        let next = tokio::select! {
            event = call.next() => Some(event),
            _ = tokio::signal::ctrl_c() => None,
        };
        match next {
            Some(Some(event)) => println!("{}", serde_json::to_string(&event)?),
            Some(None) => break,
            None => {
                tracing::info!("Cancelling call");
                call.cancel().await;
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}

/// Arguments as a JSON list. A lone non-list value becomes a single argument.
fn parse_args(raw: Option<&str>) -> Result<Vec<CallValue>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(raw).context("Arguments must be valid JSON")?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(CallValue::from).collect(),
        other => vec![CallValue::from(other)],
    })
}
