//! Sharenet peer node.
//!
//! A peer shares the regular files in one folder. Clients log in to obtain a
//! bearer token, then search the directory through the peer and download
//! straight from whichever peer owns a file.

pub mod config;
pub mod gateway;
pub mod indexer;
pub mod search;
pub mod server;
pub mod transfer;

pub use config::PeerConfig;
pub use gateway::Authenticated;
pub use indexer::{HeartbeatOutcome, IndexError, IndexReport, PeerIndexer};
pub use search::{SearchError, SearchRequest, SearchResolver, SearchResponse};
pub use server::{advertised_address, build_router, PeerServer, PeerState};
pub use transfer::{TransferError, TransferService, UploadReport, X_FILE_SIZE, X_PEER_ID};
