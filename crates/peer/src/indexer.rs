//! Scans the shared folder and publishes it to the directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sharenet_files::SharedFolder;
use sharenet_rpc::{DirectoryClient, DirectoryError};
use sharenet_types::{FileRecord, PeerId, SubmitRequest};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("submit to directory failed: {0}")]
    SubmitFailed(#[from] DirectoryError),
}

/// Result of a successful index pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_removed: usize,
    /// Whether this pass scanned the folder or reused the cached scan.
    pub rescanned: bool,
    pub indexed_at: DateTime<Utc>,
}

/// What a heartbeat did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    /// The directory knew the peer and refreshed its last-seen time.
    Alive { last_seen: DateTime<Utc>, active: bool },
    /// The directory had forgotten the peer, so its files were resubmitted.
    Reindexed { files_indexed: usize },
}

pub struct PeerIndexer {
    folder: SharedFolder,
    username: String,
    address: String,
    directory: Arc<dyn DirectoryClient>,
    cache: RwLock<Option<Vec<FileRecord>>>,
    /// Serialises index passes so submissions reach the directory in scan order.
    pass: Mutex<()>,
}

impl PeerIndexer {
    pub fn new(
        folder: SharedFolder,
        username: impl Into<String>,
        address: impl Into<String>,
        directory: Arc<dyn DirectoryClient>,
    ) -> Self {
        Self {
            folder,
            username: username.into(),
            address: address.into(),
            directory,
            cache: RwLock::new(None),
            pass: Mutex::new(()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.folder.owner()
    }

    /// Base URL submitted to the directory.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn folder(&self) -> &SharedFolder {
        &self.folder
    }

    /// Number of files in the cached scan, if one exists.
    pub fn cached_count(&self) -> Option<usize> {
        self.cache.read().as_ref().map(Vec::len)
    }

    /// Rescan the shared folder and refresh the cache.
    pub async fn scan(&self) -> Result<Vec<FileRecord>, IndexError> {
        let folder = self.folder.clone();
        let records = tokio::task::spawn_blocking(move || folder.scan())
            .await
            .map_err(|err| IndexError::ScanFailed(err.to_string()))?
            .map_err(|err| IndexError::ScanFailed(err.to_string()))?;
        *self.cache.write() = Some(records.clone());
        Ok(records)
    }

    /// The cached scan, scanning first when there is none.
    pub async fn local_files(&self) -> Result<Vec<FileRecord>, IndexError> {
        if let Some(records) = self.cache.read().clone() {
            return Ok(records);
        }
        self.scan().await
    }

    /// Submit the peer's files to the directory, replacing what it held before.
    pub async fn index(&self, force_rescan: bool) -> Result<IndexReport, IndexError> {
        let _pass = self.pass.lock().await;

        let cached = if force_rescan {
            None
        } else {
            self.cache.read().clone()
        };
        let (files, rescanned) = match cached {
            Some(files) => (files, false),
            None => (self.scan().await?, true),
        };

        let request = SubmitRequest {
            peer_id: self.peer_id().clone(),
            username: self.username.clone(),
            address: self.address.clone(),
            files,
        };
        match self.directory.submit(request).await {
            Ok(receipt) => {
                info!(
                    "indexed {} files with directory ({} removed)",
                    receipt.files_indexed, receipt.files_removed
                );
                Ok(IndexReport {
                    files_indexed: receipt.files_indexed,
                    files_removed: receipt.files_removed,
                    rescanned,
                    indexed_at: receipt.indexed_at,
                })
            }
            Err(err) => {
                warn!("index submission failed: {}", err);
                Err(err.into())
            }
        }
    }

    /// Tell the directory this peer is still up. A directory that restarted
    /// or dropped the peer gets a full submission from the cached scan.
    pub async fn heartbeat(&self) -> Result<HeartbeatOutcome, IndexError> {
        match self.directory.heartbeat(self.peer_id()).await {
            Ok(summary) => {
                debug!("heartbeat acknowledged, last seen {}", summary.last_seen);
                Ok(HeartbeatOutcome::Alive {
                    last_seen: summary.last_seen,
                    active: summary.active,
                })
            }
            Err(err) if err.is_not_found() => {
                info!("directory does not know this peer, re-indexing");
                let report = self.index(false).await?;
                Ok(HeartbeatOutcome::Reindexed {
                    files_indexed: report.files_indexed,
                })
            }
            Err(err) => {
                warn!("heartbeat failed: {}", err);
                Err(err.into())
            }
        }
    }

    /// Heartbeat every `interval`, forever. The first beat waits one interval.
    pub async fn run_heartbeats(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // Failures are logged by heartbeat(); the next tick retries.
            let _ = self.heartbeat().await;
        }
    }
}
