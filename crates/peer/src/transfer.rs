//! Serves shared files to authenticated clients and accepts uploads.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Serialize;
use sharenet_files::SharedFolder;
use sharenet_security::{AuthError, PolicyViolation, SecurityEvent, SessionInfo, SessionManager, UploadPolicy};
use sharenet_types::{encode_path_segment, ContentHash};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info, warn};

use crate::indexer::PeerIndexer;

pub use sharenet_rpc::X_PEER_ID;
pub const X_FILE_SIZE: HeaderName = HeaderName::from_static("x-file-size");

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
    #[error("file {0:?} not found")]
    NotFound(String),
    #[error("invalid filename: {0}")]
    InvalidName(String),
    #[error("uploaded file is empty")]
    Empty,
    #[error("file exceeds the {max} byte limit")]
    TooLarge { max: u64 },
    #[error("malformed upload: {0}")]
    Malformed(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<PolicyViolation> for TransferError {
    fn from(violation: PolicyViolation) -> Self {
        match violation {
            PolicyViolation::Empty => TransferError::Empty,
            PolicyViolation::TooLarge { max, .. } => TransferError::TooLarge { max },
            other => TransferError::InvalidName(other.to_string()),
        }
    }
}

/// Outcome of an accepted upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
    /// Whether the follow-up index pass reached the directory.
    pub indexed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
}

pub struct TransferService {
    sessions: Arc<SessionManager>,
    indexer: Arc<PeerIndexer>,
    policy: UploadPolicy,
}

impl TransferService {
    pub fn new(sessions: Arc<SessionManager>, indexer: Arc<PeerIndexer>, policy: UploadPolicy) -> Self {
        Self {
            sessions,
            indexer,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    fn folder(&self) -> &SharedFolder {
        self.indexer.folder()
    }

    /// Stream `filename` from the shared root. `request` supplies the method
    /// and conditional/range headers.
    pub async fn download(
        &self,
        token: &str,
        filename: &str,
        request: Request<Body>,
    ) -> Result<Response, TransferError> {
        let session = self.sessions.authorize(token)?;
        let path = self
            .folder()
            .resolve(filename)
            .map_err(|err| TransferError::InvalidName(err.to_string()))?
            .ok_or_else(|| TransferError::NotFound(filename.to_string()))?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(filename.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut response = match ServeFile::new(&path).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        };
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&format!(
            "attachment; filename*=UTF-8''{}",
            encode_path_segment(filename)
        )) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        if let Ok(value) = HeaderValue::from_str(self.indexer.peer_id().as_str()) {
            headers.insert(X_PEER_ID, value);
        }
        headers.insert(X_FILE_SIZE, HeaderValue::from(size));

        info!("serving {} ({} bytes) to {}", filename, size, session.peer_id);
        Ok(response)
    }

    /// Write an upload into the shared root, then re-index.
    ///
    /// The content is staged under a hidden name and renamed into place once
    /// complete, so scans never see a partial file.
    pub async fn upload<S>(
        &self,
        token: &str,
        filename: &str,
        chunks: S,
    ) -> Result<UploadReport, TransferError>
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Unpin,
    {
        let session = self.sessions.authorize(token)?;
        if let Err(violation) = self.policy.check_name(filename) {
            self.reject(&session, filename, &violation.to_string());
            return Err(violation.into());
        }

        let target = self
            .folder()
            .target_path(filename)
            .map_err(|err| TransferError::InvalidName(err.to_string()))?;
        let staging = self.folder().staging_path();

        let written = match self.write_staged(&staging, chunks).await {
            Ok(written) => written,
            Err(err) => {
                discard(&staging).await;
                if matches!(err, TransferError::TooLarge { .. } | TransferError::Empty) {
                    self.reject(&session, filename, &err.to_string());
                }
                return Err(err);
            }
        };
        let (size_bytes, content_hash) = written;

        if let Err(err) = tokio::fs::rename(&staging, &target).await {
            discard(&staging).await;
            return Err(err.into());
        }
        info!(
            "stored upload {} ({} bytes) from {}",
            filename, size_bytes, session.peer_id
        );

        let (indexed, index_error) = match self.indexer.index(true).await {
            Ok(_) => (true, None),
            Err(err) => {
                warn!("re-index after upload failed: {}", err);
                (false, Some(err.to_string()))
            }
        };

        Ok(UploadReport {
            filename: filename.to_string(),
            size_bytes,
            content_hash,
            indexed,
            index_error,
        })
    }

    async fn write_staged<S>(&self, staging: &Path, mut chunks: S) -> Result<(u64, ContentHash), TransferError>
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Unpin,
    {
        let max = self.policy.max_file_size();
        let mut file = tokio::fs::File::create(staging).await?;
        let mut hasher = blake3::Hasher::new();
        let mut written: u64 = 0;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > max {
                return Err(TransferError::TooLarge { max });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        if written == 0 {
            return Err(TransferError::Empty);
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok((written, ContentHash::from(hasher.finalize())))
    }

    fn reject(&self, session: &SessionInfo, filename: &str, reason: &str) {
        self.sessions.audit().record(SecurityEvent::UploadRejected {
            peer_id: session.peer_id.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        });
    }
}

async fn discard(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await {
        if err.kind() != io::ErrorKind::NotFound {
            debug!("failed to remove staged upload {}: {}", staging.display(), err);
        }
    }
}
