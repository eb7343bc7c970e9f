//! The directory's index of shared files and the peer address book.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use sharenet_types::{
    download_url, normalize_address, AddressError, DirectoryStats, FileRecord, FilenameError,
    PeerId, PeerSummary, SearchResult, SubmitReceipt, SubmitRequest,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Reasons a submission is refused by the index.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexStoreError {
    #[error("invalid peer address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("record {filename:?} is invalid: {source}")]
    InvalidRecord {
        filename: String,
        source: FilenameError,
    },
    #[error("record {filename:?} is owned by {owner}, not the submitting peer {peer_id}")]
    ForeignRecord {
        filename: String,
        owner: PeerId,
        peer_id: PeerId,
    },
}

/// Trait for file index backends.
pub trait IndexStore: Send + Sync {
    /// Replace every record held for the submitting peer with the submitted set.
    fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, IndexStoreError>;

    /// Case-insensitive substring search over filenames of every peer.
    fn query(&self, text: &str, limit: Option<usize>) -> Vec<SearchResult>;

    /// Drop a peer and its records. Returns whether the peer was known.
    fn remove_peer(&self, peer_id: &PeerId) -> bool;

    /// Address book snapshot.
    fn peers(&self) -> Vec<PeerSummary>;

    /// Mark `peer_id` as alive without resubmitting its files. `None` when the
    /// peer has never submitted.
    fn heartbeat(&self, peer_id: &PeerId) -> Option<PeerSummary>;

    /// Records last submitted by `peer_id`, or `None` for an unknown peer.
    fn peer_files(&self, peer_id: &PeerId) -> Option<Vec<FileRecord>>;

    fn stats(&self) -> DirectoryStats;
}

/// In-memory index. All state is lost on restart.
#[derive(Clone)]
pub struct MemoryIndexStore {
    inner: Arc<MemoryIndexStoreInner>,
}

struct MemoryIndexStoreInner {
    /// Peers ordered by id; query results follow this order.
    peers: RwLock<BTreeMap<PeerId, PeerEntry>>,

    /// Peers not heard from within this window are reported inactive.
    peer_timeout: Option<Duration>,
}

struct PeerEntry {
    username: String,
    address: String,
    files: BTreeMap<String, FileRecord>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl PeerEntry {
    fn summary(&self, peer_id: &PeerId, now: DateTime<Utc>, timeout: Option<Duration>) -> PeerSummary {
        let active = timeout
            .map(|timeout| now - self.last_seen <= timeout)
            .unwrap_or(true);
        PeerSummary {
            peer_id: peer_id.clone(),
            username: self.username.clone(),
            address: self.address.clone(),
            file_count: self.files.len(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            active,
        }
    }
}

impl MemoryIndexStore {
    /// Create an empty index; `peer_timeout_secs == 0` reports every peer active.
    pub fn new(peer_timeout_secs: u64) -> Self {
        let peer_timeout = (peer_timeout_secs > 0)
            .then(|| Duration::seconds(peer_timeout_secs.min(i64::MAX as u64) as i64));
        Self {
            inner: Arc::new(MemoryIndexStoreInner {
                peers: RwLock::new(BTreeMap::new()),
                peer_timeout,
            }),
        }
    }

    pub fn submit_at(
        &self,
        request: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, IndexStoreError> {
        let SubmitRequest {
            peer_id,
            username,
            address,
            files,
        } = request;

        let address = normalize_address(&address)?;
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(IndexStoreError::EmptyUsername);
        }

        // Validate everything before touching the table so a bad record
        // leaves the previous submission intact.
        let mut records = BTreeMap::new();
        for record in files {
            record
                .validate()
                .map_err(|source| IndexStoreError::InvalidRecord {
                    filename: record.filename.clone(),
                    source,
                })?;
            if record.owner != peer_id {
                return Err(IndexStoreError::ForeignRecord {
                    filename: record.filename,
                    owner: record.owner,
                    peer_id,
                });
            }
            records.insert(record.filename.clone(), record);
        }

        let files_indexed = records.len();
        let files_removed = {
            let mut peers = self.inner.peers.write();
            match peers.get_mut(&peer_id) {
                Some(entry) => {
                    let removed = entry
                        .files
                        .keys()
                        .filter(|name| !records.contains_key(*name))
                        .count();
                    entry.username = username;
                    entry.address = address;
                    entry.files = records;
                    entry.last_seen = now;
                    removed
                }
                None => {
                    info!("registered peer {} at {}", peer_id, address);
                    peers.insert(
                        peer_id.clone(),
                        PeerEntry {
                            username,
                            address,
                            files: records,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                    0
                }
            }
        };

        debug!(
            "peer {} indexed {} files ({} removed)",
            peer_id, files_indexed, files_removed
        );
        Ok(SubmitReceipt {
            peer_id,
            files_indexed,
            files_removed,
            indexed_at: now,
        })
    }

    pub fn heartbeat_at(&self, peer_id: &PeerId, now: DateTime<Utc>) -> Option<PeerSummary> {
        let mut peers = self.inner.peers.write();
        let entry = peers.get_mut(peer_id)?;
        entry.last_seen = now;
        debug!("heartbeat from {}", peer_id);
        Some(entry.summary(peer_id, now, self.inner.peer_timeout))
    }

    pub fn peers_at(&self, now: DateTime<Utc>) -> Vec<PeerSummary> {
        let peers = self.inner.peers.read();
        peers
            .iter()
            .map(|(id, entry)| entry.summary(id, now, self.inner.peer_timeout))
            .collect()
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> DirectoryStats {
        let peers = self.inner.peers.read();
        let mut stats = DirectoryStats {
            total_peers: peers.len(),
            active_peers: 0,
            total_files: 0,
        };
        for (id, entry) in peers.iter() {
            stats.total_files += entry.files.len();
            if entry.summary(id, now, self.inner.peer_timeout).active {
                stats.active_peers += 1;
            }
        }
        stats
    }
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IndexStore for MemoryIndexStore {
    fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, IndexStoreError> {
        self.submit_at(request, Utc::now())
    }

    fn query(&self, text: &str, limit: Option<usize>) -> Vec<SearchResult> {
        // Only a blank query short-circuits; surrounding spaces are part of
        // the substring otherwise.
        if text.trim().is_empty() {
            return Vec::new();
        }
        let needle = text.to_lowercase();
        let limit = limit.unwrap_or(usize::MAX);

        let peers = self.inner.peers.read();
        peers
            .iter()
            .flat_map(|(peer_id, entry)| {
                entry
                    .files
                    .values()
                    .filter(|record| record.matches(&needle))
                    .map(move |record| SearchResult {
                        filename: record.filename.clone(),
                        size_bytes: record.size_bytes,
                        content_hash: record.content_hash,
                        peer_id: peer_id.clone(),
                        peer_address: entry.address.clone(),
                        download_url: download_url(&entry.address, &record.filename),
                    })
            })
            .take(limit)
            .collect()
    }

    fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.peers.write().remove(peer_id);
        if let Some(entry) = &removed {
            info!(
                "removed peer {} ({} files dropped from index)",
                peer_id,
                entry.files.len()
            );
        }
        removed.is_some()
    }

    fn peers(&self) -> Vec<PeerSummary> {
        self.peers_at(Utc::now())
    }

    fn heartbeat(&self, peer_id: &PeerId) -> Option<PeerSummary> {
        self.heartbeat_at(peer_id, Utc::now())
    }

    fn peer_files(&self, peer_id: &PeerId) -> Option<Vec<FileRecord>> {
        let peers = self.inner.peers.read();
        peers
            .get(peer_id)
            .map(|entry| entry.files.values().cloned().collect())
    }

    fn stats(&self) -> DirectoryStats {
        self.stats_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharenet_types::ContentHash;
    use std::collections::HashSet;

    fn filenames(records: &[SearchResult]) -> HashSet<(String, String)> {
        records
            .iter()
            .map(|r| (r.peer_id.to_string(), r.filename.clone()))
            .collect()
    }

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    fn record(owner: &str, name: &str, size: u64) -> FileRecord {
        FileRecord {
            filename: name.to_string(),
            owner: peer(owner),
            size_bytes: size,
            content_hash: ContentHash::from_data(name.as_bytes()),
            path: name.to_string(),
            modified_at: None,
            indexed_at: Utc::now(),
        }
    }

    fn submission(owner: &str, port: u16, files: &[(&str, u64)]) -> SubmitRequest {
        SubmitRequest {
            peer_id: peer(owner),
            username: format!("user-{owner}"),
            address: format!("127.0.0.1:{port}"),
            files: files
                .iter()
                .map(|(name, size)| record(owner, name, *size))
                .collect(),
        }
    }

    #[test]
    fn test_submit_and_query() {
        let store = MemoryIndexStore::new(0);
        let receipt = store
            .submit(submission("peer1", 8001, &[("report.txt", 120), ("photo.jpg", 4)]))
            .unwrap();
        assert_eq!(receipt.files_indexed, 2);
        assert_eq!(receipt.files_removed, 0);

        let results = store.query("REPORT", None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].filename, "report.txt");
        assert_eq!(results[0].size_bytes, 120);
        assert_eq!(results[0].peer_address, "http://127.0.0.1:8001");
        assert_eq!(
            results[0].download_url,
            "http://127.0.0.1:8001/download/report.txt"
        );
    }

    #[test]
    fn test_identical_resubmission_is_idempotent() {
        let store = MemoryIndexStore::new(0);
        let files = [("a.txt", 1), ("b.txt", 2)];
        store.submit(submission("peer1", 8001, &files)).unwrap();
        let before = store.query("txt", None);
        let receipt = store.submit(submission("peer1", 8001, &files)).unwrap();
        let after = store.query("txt", None);
        assert_eq!(before, after);
        assert_eq!(receipt.files_removed, 0);
    }

    #[test]
    fn test_subset_resubmission_replaces() {
        let store = MemoryIndexStore::new(0);
        store
            .submit(submission("peer1", 8001, &[("a.txt", 1), ("b.txt", 2), ("c.txt", 3)]))
            .unwrap();
        let receipt = store.submit(submission("peer1", 8001, &[("b.txt", 2)])).unwrap();
        assert_eq!(receipt.files_indexed, 1);
        assert_eq!(receipt.files_removed, 2);

        let names: Vec<_> = store
            .query("txt", None)
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_query_spans_peers_without_dedup() {
        let store = MemoryIndexStore::new(0);
        store
            .submit(submission("peer1", 8001, &[("doc.txt", 1), ("image.png", 2)]))
            .unwrap();
        store
            .submit(submission("peer2", 8002, &[("Doc.txt", 1), ("MyDocs.pdf", 3)]))
            .unwrap();

        let hits = filenames(&store.query("doc", None));
        let expected: HashSet<_> = [
            ("peer1".to_string(), "doc.txt".to_string()),
            ("peer2".to_string(), "Doc.txt".to_string()),
            ("peer2".to_string(), "MyDocs.pdf".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(hits, expected);
    }

    #[test]
    fn test_query_limit_and_empty_query() {
        let store = MemoryIndexStore::new(0);
        store
            .submit(submission("peer1", 8001, &[("a.txt", 1), ("b.txt", 2), ("c.txt", 3)]))
            .unwrap();
        assert_eq!(store.query("txt", Some(2)).len(), 2);
        assert!(store.query("   ", None).is_empty());
    }

    #[test]
    fn test_query_keeps_surrounding_spaces() {
        let store = MemoryIndexStore::new(0);
        store
            .submit(submission("peer1", 8001, &[("report.txt", 1), ("Annual Report 2024.pdf", 2)]))
            .unwrap();

        let names: Vec<_> = store
            .query("report ", None)
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["Annual Report 2024.pdf".to_string()]);
        assert_eq!(store.query("report", None).len(), 2);
        assert!(store.query("\t\n", None).is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_idle_peer_active() {
        let store = MemoryIndexStore::new(60);
        let t0 = Utc::now();
        store
            .submit_at(submission("peer1", 8001, &[("a.txt", 1)]), t0)
            .unwrap();

        let summary = store
            .heartbeat_at(&peer("peer1"), t0 + Duration::seconds(50))
            .unwrap();
        assert_eq!(summary.last_seen, t0 + Duration::seconds(50));
        assert_eq!(summary.file_count, 1);

        let peers = store.peers_at(t0 + Duration::seconds(100));
        assert!(peers[0].active);
        assert_eq!(peers[0].first_seen, t0);
        assert!(!store.peers_at(t0 + Duration::seconds(111))[0].active);

        assert!(store.heartbeat_at(&peer("ghost"), t0).is_none());
        assert!(store.peers_at(t0).iter().all(|p| p.peer_id.as_str() != "ghost"));
    }

    #[test]
    fn test_invalid_record_keeps_previous_submission() {
        let store = MemoryIndexStore::new(0);
        store.submit(submission("peer1", 8001, &[("a.txt", 1)])).unwrap();

        let mut bad = submission("peer1", 8001, &[("b.txt", 1)]);
        bad.files.push(record("peer1", "../escape", 1));
        assert!(matches!(
            store.submit(bad),
            Err(IndexStoreError::InvalidRecord { .. })
        ));

        let mut foreign = submission("peer1", 8001, &[]);
        foreign.files.push(record("peer2", "x.txt", 1));
        assert!(matches!(
            store.submit(foreign),
            Err(IndexStoreError::ForeignRecord { .. })
        ));

        assert_eq!(store.query("a.txt", None).len(), 1);
    }

    #[test]
    fn test_invalid_address_and_username() {
        let store = MemoryIndexStore::new(0);
        let mut req = submission("peer1", 8001, &[]);
        req.address = "ftp://x".into();
        assert!(matches!(
            store.submit(req),
            Err(IndexStoreError::InvalidAddress(_))
        ));

        let mut req = submission("peer1", 8001, &[]);
        req.username = " ".into();
        assert_eq!(store.submit(req), Err(IndexStoreError::EmptyUsername));
    }

    #[test]
    fn test_remove_peer() {
        let store = MemoryIndexStore::new(0);
        store.submit(submission("peer1", 8001, &[("a.txt", 1)])).unwrap();
        assert!(store.remove_peer(&peer("peer1")));
        assert!(!store.remove_peer(&peer("peer1")));
        assert!(store.query("a", None).is_empty());
        assert!(store.peer_files(&peer("peer1")).is_none());
    }

    #[test]
    fn test_address_book_tracks_latest_submission() {
        let store = MemoryIndexStore::new(60);
        let t0 = Utc::now();
        store
            .submit_at(submission("peer1", 8001, &[("a.txt", 1)]), t0)
            .unwrap();
        store
            .submit_at(
                submission("peer1", 9001, &[("a.txt", 1), ("b.txt", 1)]),
                t0 + Duration::seconds(10),
            )
            .unwrap();

        let peers = store.peers_at(t0 + Duration::seconds(20));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, "http://127.0.0.1:9001");
        assert_eq!(peers[0].file_count, 2);
        assert_eq!(peers[0].first_seen, t0);
        assert!(peers[0].active);

        let later = store.peers_at(t0 + Duration::seconds(100));
        assert!(!later[0].active);

        let stats = store.stats_at(t0 + Duration::seconds(100));
        assert_eq!(stats.total_peers, 1);
        assert_eq!(stats.active_peers, 0);
        assert_eq!(stats.total_files, 2);
    }

    #[test]
    fn test_duplicate_names_in_one_submission_keep_last() {
        let store = MemoryIndexStore::new(0);
        store
            .submit(submission("peer1", 8001, &[("a.txt", 1), ("a.txt", 7)]))
            .unwrap();
        let hits = store.query("a.txt", None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].size_bytes, 7);
    }
}
