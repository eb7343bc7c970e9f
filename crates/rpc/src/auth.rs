//! Credentials accepted by the directory.
//!
//! Each peer holds a shared secret registered with the directory and sends it
//! as a bearer token next to an `X-Peer-Id` header. Removing peers needs the
//! separate admin token.

use std::collections::HashMap;
use std::fmt;

use axum::http::{header, HeaderMap, HeaderName};
use sharenet_types::PeerId;
use thiserror::Error;

use crate::error::ApiError;

/// Names the peer a request is made by (directory RPC) or served from
/// (peer downloads).
pub const X_PEER_ID: HeaderName = HeaderName::from_static("x-peer-id");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("missing bearer credential")]
    MissingToken,
    #[error("missing or invalid x-peer-id header")]
    MissingPeerId,
    #[error("peer {0} has no credential on this directory")]
    UnknownPeer(PeerId),
    #[error("invalid credential for peer {0}")]
    InvalidSecret(PeerId),
    #[error("peer {caller} cannot act for peer {claimed}")]
    PeerMismatch { caller: PeerId, claimed: PeerId },
    #[error("admin credential required")]
    AdminRequired,
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        ApiError::unauthorized(err.to_string())
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Who the caller proved to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Peer(PeerId),
    Admin,
}

/// Secrets are kept as BLAKE3 digests and compared digest to digest.
#[derive(Clone, Default)]
pub struct DirectoryCredentials {
    peers: HashMap<PeerId, blake3::Hash>,
    admin: Option<blake3::Hash>,
}

impl DirectoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer_id: PeerId, secret: &str) -> Self {
        self.add_peer(peer_id, secret);
        self
    }

    pub fn with_admin(mut self, token: &str) -> Self {
        self.admin = Some(blake3::hash(token.as_bytes()));
        self
    }

    pub fn add_peer(&mut self, peer_id: PeerId, secret: &str) {
        self.peers.insert(peer_id, blake3::hash(secret.as_bytes()));
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_admin(&self) -> bool {
        self.admin.is_some()
    }

    /// Resolve the peer behind `X-Peer-Id` and check its bearer secret.
    pub fn authenticate_peer(&self, headers: &HeaderMap) -> Result<PeerId, CredentialError> {
        let secret = bearer_token(headers).ok_or(CredentialError::MissingToken)?;
        let peer_id = headers
            .get(X_PEER_ID)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| PeerId::parse(value).ok())
            .ok_or(CredentialError::MissingPeerId)?;
        let expected = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| CredentialError::UnknownPeer(peer_id.clone()))?;
        // blake3::Hash equality is constant time
        if blake3::hash(secret.as_bytes()) == *expected {
            Ok(peer_id)
        } else {
            Err(CredentialError::InvalidSecret(peer_id))
        }
    }

    /// Like [`authenticate_peer`](Self::authenticate_peer), and the peer
    /// must be the one named in the request body.
    pub fn authenticate_as(
        &self,
        headers: &HeaderMap,
        claimed: &PeerId,
    ) -> Result<PeerId, CredentialError> {
        let caller = self.authenticate_peer(headers)?;
        if caller == *claimed {
            Ok(caller)
        } else {
            Err(CredentialError::PeerMismatch {
                caller,
                claimed: claimed.clone(),
            })
        }
    }

    pub fn authenticate_admin(&self, headers: &HeaderMap) -> Result<(), CredentialError> {
        let expected = self.admin.as_ref().ok_or(CredentialError::AdminRequired)?;
        let token = bearer_token(headers).ok_or(CredentialError::AdminRequired)?;
        if blake3::hash(token.as_bytes()) == *expected {
            Ok(())
        } else {
            Err(CredentialError::AdminRequired)
        }
    }

    /// Admin when the bearer token is the admin token, otherwise a peer.
    pub fn authenticate_reader(&self, headers: &HeaderMap) -> Result<Caller, CredentialError> {
        if self.authenticate_admin(headers).is_ok() {
            return Ok(Caller::Admin);
        }
        self.authenticate_peer(headers).map(Caller::Peer)
    }
}

impl fmt::Debug for DirectoryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut peers: Vec<_> = self.peers.keys().map(PeerId::as_str).collect();
        peers.sort_unstable();
        f.debug_struct("DirectoryCredentials")
            .field("peers", &peers)
            .field("admin", &self.admin.is_some())
            .finish()
    }
}
