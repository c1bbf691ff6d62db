//! Chunked multipart upload of binary attachments.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::models::BROKEN_CONNECTION_MSG;
use crate::payload::BinaryHandle;
use crate::transport::{FilePart, Transport};

/// Files per upload request.
pub const UPLOAD_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// The upload request never reached the server.
    #[error("{}", BROKEN_CONNECTION_MSG)]
    BrokenConnection,

    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Upload rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed upload response: {0}")]
    Malformed(String),
}

/// Upload `files` in chunks of [`UPLOAD_CHUNK_SIZE`].
///
/// Returns one entry per input file, in order. A failed chunk yields its
/// error for every file it contained and later chunks are still attempted.
pub async fn upload_files(
    transport: &dyn Transport,
    url: &Url,
    files: &[BinaryHandle],
    token: Option<&str>,
) -> Vec<Result<String, UploadError>> {
    let mut results = Vec::with_capacity(files.len());
    for (index, chunk) in files.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
        match upload_chunk(transport, url, chunk, token).await {
            Ok(handles) => {
                debug!("Uploaded chunk {} ({} files)", index, chunk.len());
                results.extend(handles.into_iter().map(Ok));
            }
            Err(e) => {
                warn!("Upload chunk {} failed: {}", index, e);
                results.extend(std::iter::repeat(Err(e)).take(chunk.len()));
            }
        }
    }
    results
}

async fn upload_chunk(
    transport: &dyn Transport,
    url: &Url,
    chunk: &[BinaryHandle],
    token: Option<&str>,
) -> Result<Vec<String>, UploadError> {
    let mut parts = Vec::with_capacity(chunk.len());
    for handle in chunk {
        parts.push(read_part(handle).await?);
    }

    let reply = transport.post_files(url, parts, token).await.map_err(|e| {
        debug!("Upload request to {} failed: {}", url, e);
        UploadError::BrokenConnection
    })?;
    if !reply.is_success() {
        return Err(UploadError::Rejected {
            status: reply.status,
            message: reply.body,
        });
    }

    let handles: Vec<String> =
        serde_json::from_str(&reply.body).map_err(|e| UploadError::Malformed(e.to_string()))?;
    if handles.len() != chunk.len() {
        return Err(UploadError::Malformed(format!(
            "expected {} file handles, got {}",
            chunk.len(),
            handles.len()
        )));
    }
    Ok(handles)
}

async fn read_part(handle: &BinaryHandle) -> Result<FilePart, UploadError> {
    match handle {
        BinaryHandle::Bytes { data, name, mime } => Ok(FilePart {
            name: name.clone().unwrap_or_else(|| "blob".to_string()),
            mime: mime.clone(),
            data: data.clone(),
        }),
        BinaryHandle::Path(path) => {
            let data = tokio::fs::read(path).await.map_err(|e| UploadError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            Ok(FilePart {
                name: handle.file_name().unwrap_or_else(|| "file".to_string()),
                mime: None,
                data: Bytes::from(data),
            })
        }
    }
}
