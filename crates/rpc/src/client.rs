//! Peer-side access to the directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sharenet_files::IndexStore;
use sharenet_types::{
    normalize_address, AddressError, ErrorBody, HeartbeatRequest, PeerId, PeerSummary,
    PeersResponse, QueryRequest, QueryResponse, SubmitReceipt, SubmitRequest,
};
use thiserror::Error;
use tracing::debug;

use crate::auth::X_PEER_ID;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid directory url: {0}")]
    InvalidUrl(#[from] AddressError),
    #[error("directory unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("directory returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed directory response: {0}")]
    Decode(String),
}

impl DirectoryError {
    /// The directory has no entry for the peer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::Status { status: 404, .. })
    }
}

/// Operations a peer needs from the directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, DirectoryError>;

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, DirectoryError>;

    async fn peers(&self) -> Result<PeersResponse, DirectoryError>;

    /// Refresh the peer's last-seen time without resubmitting its files.
    async fn heartbeat(&self, peer_id: &PeerId) -> Result<PeerSummary, DirectoryError>;
}

/// JSON-over-HTTP client for a remote directory. No retries.
#[derive(Clone)]
pub struct HttpDirectoryClient {
    client: Client,
    base_url: String,
    credentials: Option<(PeerId, String)>,
}

impl HttpDirectoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let base_url = normalize_address(base_url)?;
        let mut builder = Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(DirectoryError::Transport)?;
        Ok(Self {
            client,
            base_url,
            credentials: None,
        })
    }

    /// Sign every request as `peer_id` with its directory secret.
    pub fn with_credentials(mut self, peer_id: PeerId, secret: impl Into<String>) -> Self {
        self.credentials = Some((peer_id, secret.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((peer_id, secret)) => request
                .header(X_PEER_ID, peer_id.as_str())
                .bearer_auth(secret),
            None => request,
        }
    }

    async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> Result<R, DirectoryError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("POST {}", url);
        let response = self
            .authorize(self.client.post(url))
            .json(body)
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        decode(response).await
    }

    async fn get_json<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R, DirectoryError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("GET {}", url);
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        decode(response).await
    }
}

async fn decode<R: DeserializeOwned>(response: Response) -> Result<R, DirectoryError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(DirectoryError::Transport)?;
    if !status.is_success() {
        let message = match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => body.message,
            Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
        };
        return Err(DirectoryError::Status {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_slice(&bytes).map_err(|err| DirectoryError::Decode(err.to_string()))
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, DirectoryError> {
        self.post_json("/rpc/submit", &request).await
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, DirectoryError> {
        self.post_json("/rpc/query", &request).await
    }

    async fn peers(&self) -> Result<PeersResponse, DirectoryError> {
        self.get_json("/peers").await
    }

    async fn heartbeat(&self, peer_id: &PeerId) -> Result<PeerSummary, DirectoryError> {
        let request = HeartbeatRequest {
            peer_id: peer_id.clone(),
        };
        self.post_json("/rpc/heartbeat", &request).await
    }
}

/// Directory living in the same process. Calls are trusted and skip the
/// credential check.
#[derive(Clone)]
pub struct LocalDirectory {
    index: Arc<dyn IndexStore>,
}

impl LocalDirectory {
    pub fn new(index: Arc<dyn IndexStore>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }
}

#[async_trait]
impl DirectoryClient for LocalDirectory {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, DirectoryError> {
        self.index
            .submit(request)
            .map_err(|err| DirectoryError::Status {
                status: 400,
                message: err.to_string(),
            })
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, DirectoryError> {
        let results = self.index.query(&request.query, request.limit);
        Ok(QueryResponse {
            query: request.query,
            results,
        })
    }

    async fn peers(&self) -> Result<PeersResponse, DirectoryError> {
        let peers = self.index.peers();
        Ok(PeersResponse {
            total: peers.len(),
            peers,
        })
    }

    async fn heartbeat(&self, peer_id: &PeerId) -> Result<PeerSummary, DirectoryError> {
        self.index
            .heartbeat(peer_id)
            .ok_or_else(|| DirectoryError::Status {
                status: 404,
                message: format!("peer {peer_id} is not registered"),
            })
    }
}
