//! Server app configuration and client options.
//!
//! `AppConfig` is the document served at `<root>/config`. It names the wire
//! protocol, the invokable dependencies and the component types behind each
//! input. Every URL the client talks to is derived from it.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::models::EndpointRef;
use crate::protocol::Protocol;

/// App configuration document.
pub const CONFIG_URL: &str = "config";
/// Shared event stream for the multiplexed protocols.
pub const SSE_URL: &str = "queue/data";
/// Queue submission. POST for the multiplexed protocols, GET stream for legacy `sse`.
pub const SSE_DATA_URL: &str = "queue/join";
/// Socket endpoint for the `ws` protocol.
pub const WS_URL: &str = "queue/join";
/// Payload delivery for the legacy `sse` protocol.
pub const LEGACY_SSE_DATA_URL: &str = "queue/data";
pub const UPLOAD_URL: &str = "upload";
pub const RESET_URL: &str = "reset";
pub const CANCEL_URL: &str = "cancel";
pub const RUN_URL: &str = "run";

/// Server version assumed when the config does not report one.
pub const DEFAULT_SERVER_VERSION: &str = "2.0.0";

/// Environment variable holding a bearer token for private apps.
pub const TOKEN_ENV: &str = "QUEUECALL_TOKEN";
/// Environment variable holding a signed session token for the event stream.
pub const JWT_ENV: &str = "QUEUECALL_JWT";

// =============================================================================
// App configuration
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTypes {
    #[serde(default)]
    pub generator: bool,
    #[serde(default)]
    pub continuous: bool,
}

/// One invokable endpoint of the app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Public api name. Servers send `false` for endpoints hidden from the api.
    #[serde(default, deserialize_with = "name_or_hidden")]
    pub api_name: Option<String>,
    /// Per-endpoint queue override. `None` falls back to the app setting.
    #[serde(default)]
    pub queue: Option<bool>,
    #[serde(default)]
    pub types: DependencyTypes,
    /// Component ids of the endpoint inputs, in parameter order.
    #[serde(default)]
    pub inputs: Vec<u64>,
    /// `"stream"` for endpoints whose outputs arrive as media chunks.
    #[serde(default)]
    pub connection: Option<String>,
}

impl Dependency {
    /// Whether outputs are streamed media chunks rather than diffable values.
    pub fn is_stream_connection(&self) -> bool {
        self.connection.as_deref() == Some("stream")
    }
}

fn name_or_hidden<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(name)) => Some(name),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// App configuration as served by the compute server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root URL of the app. Filled in by the client when the server leaves it empty.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub api_prefix: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub enable_queue: bool,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub components: Vec<ComponentInfo>,
}

impl AppConfig {
    /// Parse a config document fetched from `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON or names an
    /// unknown protocol.
    pub fn from_json(root: &str, json: &str) -> Result<Self, serde_json::Error> {
        let mut config: AppConfig = serde_json::from_str(json)?;
        if config.root.is_empty() {
            config.root = root.trim_end_matches('/').to_string();
        }
        Ok(config)
    }

    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_SERVER_VERSION)
    }

    pub fn dependency(&self, fn_index: usize) -> Option<&Dependency> {
        self.dependencies.get(fn_index)
    }

    /// Resolve an endpoint reference to its dependency index.
    ///
    /// Names match with or without the leading slash. Numeric references are
    /// passed through so endpoints can be invoked before the config lists them.
    pub fn resolve_endpoint(&self, endpoint: &EndpointRef) -> Option<usize> {
        match endpoint {
            EndpointRef::Index(index) => Some(*index),
            EndpointRef::Name(name) => {
                let wanted = name.trim_start_matches('/');
                self.dependencies.iter().position(|dep| {
                    dep.api_name
                        .as_deref()
                        .is_some_and(|api| api.trim_start_matches('/') == wanted)
                })
            }
        }
    }

    /// Whether calls to `fn_index` bypass the queue.
    pub fn skip_queue(&self, fn_index: usize) -> bool {
        let queued = self
            .dependency(fn_index)
            .and_then(|dep| dep.queue)
            .unwrap_or(self.enable_queue);
        !queued
    }

    /// Whether the endpoint streams media chunks instead of diffable outputs.
    pub fn is_stream_connection(&self, fn_index: usize) -> bool {
        self.dependency(fn_index)
            .is_some_and(Dependency::is_stream_connection)
    }

    /// Component type behind each parameter of `fn_index`, in order.
    pub fn parameter_components(&self, fn_index: usize) -> Vec<Option<String>> {
        let Some(dep) = self.dependency(fn_index) else {
            return Vec::new();
        };
        dep.inputs
            .iter()
            .map(|id| {
                self.components
                    .iter()
                    .find(|component| component.id == *id)
                    .map(|component| component.kind.clone())
            })
            .collect()
    }

    /// HTTP URL of `path` under the app root and api prefix.
    pub fn endpoint_url(&self, path: &str) -> Result<Url, url::ParseError> {
        let base = self.root.trim_end_matches('/');
        let mut prefix = self.api_prefix.trim_end_matches('/').to_string();
        if !prefix.is_empty() && !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        Url::parse(&format!(
            "{}{}/{}",
            base,
            prefix,
            path.trim_start_matches('/')
        ))
    }

    /// Socket URL of `path`, with the HTTP scheme swapped for its ws counterpart.
    pub fn socket_url(&self, path: &str) -> Result<Url, url::ParseError> {
        let http = self.endpoint_url(path)?;
        let raw = http.as_str();
        let swapped = if let Some(rest) = raw.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = raw.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            raw.to_string()
        };
        Url::parse(&swapped)
    }

    /// URL of the direct execution route for an endpoint label.
    pub fn run_url(&self, endpoint: &str) -> Result<Url, url::ParseError> {
        self.endpoint_url(&format!(
            "{}/{}",
            RUN_URL,
            endpoint.trim_start_matches('/')
        ))
    }
}

/// Append raw `a=b&c=d` parameters to a URL.
pub fn append_url_params(url: &mut Url, params: Option<&str>) {
    let Some(params) = params.filter(|p| !p.is_empty()) else {
        return;
    };
    let params = params.trim_start_matches('?');
    let mut pairs = url.query_pairs_mut();
    for (key, value) in url::form_urlencoded::parse(params.as_bytes()) {
        pairs.append_pair(&key, &value);
    }
}

// =============================================================================
// Client options
// =============================================================================

/// Per-client settings that are not part of the app config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bearer token sent with every HTTP request.
    pub token: Option<String>,
    /// Signed session token appended to stream URLs as `__sign`.
    pub jwt: Option<String>,
    /// Extra query parameters forwarded on submission URLs.
    pub url_params: Option<String>,
    /// Upload identity shared by the upload requests of a submission.
    /// A fresh one is generated per submission when unset.
    pub upload_id: Option<String>,
}

impl ClientOptions {
    /// Options from `QUEUECALL_TOKEN` and `QUEUECALL_JWT`. Empty values are ignored.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            token: read(TOKEN_ENV),
            jwt: read(JWT_ENV),
            url_params: None,
            upload_id: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    pub fn with_url_params(mut self, params: impl Into<String>) -> Self {
        self.url_params = Some(params.into());
        self
    }

    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }
}
