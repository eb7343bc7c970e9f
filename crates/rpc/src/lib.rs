//! Directory RPC for Sharenet: the directory's HTTP server and the clients
//! peers use to reach it.

pub mod auth;
pub mod client;
pub mod directory;
pub mod error;

pub use auth::{bearer_token, Caller, CredentialError, DirectoryCredentials, X_PEER_ID};
pub use client::{DirectoryClient, DirectoryError, HttpDirectoryClient, LocalDirectory};
pub use directory::{bind_listener, build_router, serve, start_server, DirectoryHealth, DirectoryState};
pub use error::ApiError;
