//! Client entry point.
//!
//! A [`Client`] is bound to one app: its config, options, session hash and
//! the shared event stream its multiplexed calls listen on. Each
//! [`Client::submit`] spawns the call lifecycle the app's protocol needs and
//! hands back a [`CallStream`] of its events.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::connect("http://localhost:7860", ClientOptions::from_env()).await?;
//! let output = client.predict(CallRequest::new("/predict", vec!["hello".into()])).await?;
//! ```

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bridge::{CallStream, EventSink};
use crate::call::{CallContext, Emitter, Lifecycle, QueueControl, RenderSink};
use crate::config::{AppConfig, ClientOptions, CONFIG_URL, SSE_URL, UPLOAD_URL};
use crate::models::{CallEvent, CallRequest, Payload, Stage};
use crate::payload::{
    insert_resolved, walk_and_store_blobs, BinaryHandle, CallValue, PayloadError, ResolvedBlob,
};
use crate::stream::StreamMultiplexer;
use crate::transport::{ReqwestTransport, Transport, TransportError};
use crate::upload::UploadError;

/// Errors raised before a call's lifecycle starts.
///
/// Failures after that point are reported as error statuses on the call's
/// event stream instead.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The app config could not be fetched or parsed.
    #[error("Could not load app config: {0}")]
    Config(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The call ended with an error status.
    #[error("{0}")]
    Call(String),
}

struct ClientInner {
    config: Arc<AppConfig>,
    options: Arc<ClientOptions>,
    session_hash: String,
    transport: Arc<dyn Transport>,
    multiplexer: Arc<StreamMultiplexer>,
    render_sink: RwLock<Option<Arc<dyn RenderSink>>>,
}

/// Handle to one app. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client over HTTP for an already loaded config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config's root does not form a valid stream URL.
    pub fn new(config: AppConfig, options: ClientOptions) -> Result<Self, ClientError> {
        Self::with_transport(config, options, Arc::new(ReqwestTransport::new()))
    }

    /// Client over an arbitrary [`Transport`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config's root does not form a valid stream URL.
    pub fn with_transport(
        config: AppConfig,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let session_hash = Uuid::new_v4().simple().to_string();

        let mut stream_url = config.endpoint_url(SSE_URL)?;
        {
            let mut query = stream_url.query_pairs_mut();
            query.append_pair("session_hash", &session_hash);
            if let Some(jwt) = options.jwt.as_deref() {
                query.append_pair("__sign", jwt);
            }
        }
        let multiplexer = StreamMultiplexer::new(
            Arc::clone(&transport),
            config.protocol,
            stream_url,
            options.token.clone(),
        );

        debug!(
            "Client for {} using {} (session {})",
            config.root, config.protocol, session_hash
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                config: Arc::new(config),
                options: Arc::new(options),
                session_hash,
                transport,
                multiplexer,
                render_sink: RwLock::new(None),
            }),
        })
    }

    /// Fetch `<root>/config` and build a client over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be fetched or parsed.
    pub async fn connect(root: &str, options: ClientOptions) -> Result<Self, ClientError> {
        Self::connect_with_transport(root, options, Arc::new(ReqwestTransport::new())).await
    }

    /// [`Client::connect`] over an arbitrary [`Transport`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be fetched or parsed.
    pub async fn connect_with_transport(
        root: &str,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let root = root.trim_end_matches('/');
        let url = url::Url::parse(&format!("{}/{}", root, CONFIG_URL))?;
        let reply = transport.get(&url, options.token.as_deref()).await?;
        if !reply.is_success() {
            return Err(ClientError::Config(format!(
                "{} returned status {}",
                url, reply.status
            )));
        }
        let config =
            AppConfig::from_json(root, &reply.body).map_err(|e| ClientError::Config(e.to_string()))?;
        info!(
            "Connected to {} (version {}, protocol {})",
            root,
            config.version_or_default(),
            config.protocol
        );
        Self::with_transport(config, options, transport)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn session_hash(&self) -> &str {
        &self.inner.session_hash
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.inner.multiplexer
    }

    /// Receive `render_config` updates of later calls.
    pub fn set_render_sink(&self, sink: Arc<dyn RenderSink>) {
        *self.inner.render_sink.write() = Some(sink);
    }

    /// Submit a call and return its event stream.
    ///
    /// The lifecycle runs on a spawned task, so this must be called from
    /// within a Tokio runtime. Attachments are uploaded before the payload
    /// is sent; an upload failure ends the stream with an error status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownEndpoint`] if the endpoint name does not
    /// match any dependency.
    pub fn submit(&self, request: CallRequest) -> Result<CallStream, ClientError> {
        let inner = &self.inner;
        let fn_index = inner
            .config
            .resolve_endpoint(&request.endpoint)
            .ok_or_else(|| ClientError::UnknownEndpoint(request.endpoint.label()))?;
        let endpoint = request.endpoint.label();

        let lifecycle = Lifecycle::select(
            inner.config.protocol,
            inner.config.skip_queue(fn_index),
            inner.config.version_or_default(),
        );
        let control = QueueControl::new(
            lifecycle,
            fn_index,
            inner.session_hash.clone(),
            Arc::clone(&inner.config),
            inner.options.token.clone(),
            Arc::clone(&inner.transport),
            Arc::clone(&inner.multiplexer),
        );
        let (sink, events) = EventSink::channel();
        let stream = CallStream::new(events, sink.clone(), control.clone());
        let mut emitter = Emitter::new(
            sink,
            endpoint.clone(),
            fn_index,
            request.event_data.clone(),
            request.trigger_id,
        );

        debug!("Submitting {} (fn_index {}) as {:?}", endpoint, fn_index, lifecycle);
        let client = self.clone();
        tokio::spawn(async move {
            let render_sink = client.inner.render_sink.read().clone();
            let data = match client.handle_blob(fn_index, &request.data).await {
                Ok(data) => data,
                Err(e) => {
                    error!("Could not prepare payload for {}: {}", endpoint, e);
                    emitter.error(&e.to_string(), false);
                    emitter.close();
                    return;
                }
            };
            let ctx = CallContext {
                endpoint,
                fn_index,
                payload: Payload {
                    data,
                    event_data: request.event_data,
                    fn_index,
                    trigger_id: request.trigger_id,
                },
                session_hash: client.inner.session_hash.clone(),
                config: Arc::clone(&client.inner.config),
                options: Arc::clone(&client.inner.options),
                transport: Arc::clone(&client.inner.transport),
                multiplexer: Arc::clone(&client.inner.multiplexer),
                control,
                render_sink,
            };
            lifecycle.run(ctx, emitter).await;
        });
        Ok(stream)
    }

    /// Submit a call and wait for its first output.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Call`] with the server's message if the call
    /// errors or ends without output.
    pub async fn predict(&self, request: CallRequest) -> Result<Value, ClientError> {
        let mut stream = self.submit(request)?;
        while let Some(event) = stream.next().await {
            match event {
                CallEvent::Data(data) => return Ok(data.data),
                CallEvent::Status(status) if status.status.stage == Stage::Error => {
                    return Err(ClientError::Call(
                        status
                            .status
                            .message
                            .unwrap_or_else(|| "Call failed".to_string()),
                    ));
                }
                _ => {}
            }
        }
        Err(ClientError::Call("Call ended without output".to_string()))
    }

    /// Upload every attachment in `data` and return the arguments with the
    /// server's file references in their place.
    ///
    /// # Errors
    ///
    /// Returns the first upload failure, or a payload error if a reference
    /// cannot be written back.
    pub async fn handle_blob(&self, fn_index: usize, data: &[CallValue]) -> Result<Vec<Value>, ClientError> {
        let prepared = walk_and_store_blobs(data, &self.inner.config.parameter_components(fn_index));
        let mut data = prepared.data;

        let pending: Vec<_> = prepared
            .blobs
            .into_iter()
            .filter_map(|blob_ref| blob_ref.blob.clone().map(|handle| (blob_ref, handle)))
            .collect();
        if pending.is_empty() {
            return Ok(data);
        }

        let upload_id = self
            .inner
            .options
            .upload_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let files: Vec<BinaryHandle> = pending.iter().map(|(_, handle)| handle.clone()).collect();
        let results = self.upload_files(&files, Some(&upload_id)).await?;

        let resolved = pending
            .into_iter()
            .zip(results)
            .map(|((blob_ref, _), result)| result.map(|handle| ResolvedBlob { blob_ref, handle }))
            .collect::<Result<Vec<_>, _>>()?;
        insert_resolved(&mut data, &resolved)?;
        Ok(data)
    }

    /// Upload files to the app, optionally under a shared `upload_id`.
    ///
    /// Returns one result per file, in order.
    ///
    /// # Errors
    ///
    /// Returns an error only if the upload URL cannot be built.
    pub async fn upload_files(
        &self,
        files: &[BinaryHandle],
        upload_id: Option<&str>,
    ) -> Result<Vec<Result<String, UploadError>>, ClientError> {
        let mut url = self.inner.config.endpoint_url(UPLOAD_URL)?;
        if let Some(id) = upload_id {
            url.query_pairs_mut().append_pair("upload_id", id);
        }
        Ok(crate::upload::upload_files(
            self.inner.transport.as_ref(),
            &url,
            files,
            self.inner.options.token.as_deref(),
        )
        .await)
    }

    /// Close the shared event stream. Calls still listening on it end with
    /// a broken-connection status.
    pub fn disconnect(&self) {
        info!("Disconnecting from {}", self.inner.config.root);
        self.inner.multiplexer.shutdown();
    }
}
