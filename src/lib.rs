//! queuecall - async client for queued and streaming compute endpoints.
//!
//! The crate talks to apps that run user functions behind a server-side
//! queue. It covers:
//!
//! - `client` - app connection, submission and blob upload
//! - `call` - one lifecycle per wire protocol (`ws`, `sse`, `sse_v1`..`sse_v3`, no queue)
//! - `stream` - the shared event stream multiplexed across calls
//! - `diff` - output patches sent by generator endpoints
//! - `payload` / `upload` - attachment extraction and chunked upload
//! - `bridge` - the [`CallStream`] handed back to callers
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use queuecall::{CallEvent, CallRequest, Client, ClientOptions};
//!
//! let client = Client::connect("http://localhost:7860", ClientOptions::from_env()).await?;
//! let mut call = client.submit(CallRequest::new("/predict", vec!["hello".into()]))?;
//! while let Some(event) = call.next().await {
//!     println!("{:?}", event);
//! }
//! client.disconnect();
//! ```

pub mod bridge;
pub mod call;
pub mod client;
pub mod config;
pub mod diff;
pub mod models;
pub mod payload;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod upload;


pub use bridge::{CallStream, CancelHandle};
pub use call::RenderSink;
pub use client::{Client, ClientError};
pub use config::{AppConfig, ClientOptions};
pub use models::{CallEvent, CallRequest, EndpointRef, Stage, Status};
pub use payload::{BinaryHandle, CallValue};
pub use protocol::Protocol;
