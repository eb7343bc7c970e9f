//! JSON messages exchanged between peers and the directory.

use crate::address::PeerId;
use crate::file_record::{ContentHash, FileRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full-replace submission of a peer's shared files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    pub peer_id: PeerId,
    pub username: String,
    /// Base URL other clients use to reach the peer.
    pub address: String,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub peer_id: PeerId,
    /// Records now held for the peer.
    pub files_indexed: usize,
    /// Records dropped because the new submission no longer lists them.
    pub files_removed: usize,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Liveness ping from a peer that has already submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    pub peer_id: PeerId,
}

/// One match, pointing at the peer that can serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
    pub peer_id: PeerId,
    pub peer_address: String,
    pub download_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Directory view of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub username: String,
    pub address: String,
    pub file_count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    pub total: usize,
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub total_peers: usize,
    pub active_peers: usize,
    pub total_files: usize,
}

/// Error payload returned by every Sharenet HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
