//! Authorized pass-through to the directory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sharenet_rpc::{DirectoryClient, DirectoryError};
use sharenet_security::{AuthError, SessionManager};
use sharenet_types::{PeersResponse, QueryRequest, SearchResult};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
    #[error("directory query failed: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results_count: usize,
    pub results: Vec<SearchResult>,
}

pub struct SearchResolver {
    sessions: Arc<SessionManager>,
    directory: Arc<dyn DirectoryClient>,
}

impl SearchResolver {
    pub fn new(sessions: Arc<SessionManager>, directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            sessions,
            directory,
        }
    }

    pub async fn search(
        &self,
        token: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<SearchResponse, SearchError> {
        let session = self.sessions.authorize(token)?;
        let response = self
            .directory
            .query(QueryRequest {
                query: query.to_string(),
                limit,
            })
            .await?;
        debug!(
            "{} searched {:?}: {} results",
            session.peer_id,
            query,
            response.results.len()
        );
        Ok(SearchResponse {
            query: response.query,
            results_count: response.results.len(),
            results: response.results,
        })
    }

    /// The directory's address book.
    pub async fn network(&self, token: &str) -> Result<PeersResponse, SearchError> {
        self.sessions.authorize(token)?;
        Ok(self.directory.peers().await?)
    }
}
