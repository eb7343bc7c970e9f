//! Session issuance and validation for a peer's protected operations.
//!
//! Policy: a peer id holds at most one active session. A successful login
//! revokes any token previously issued to the same peer id. Expired sessions
//! are evicted lazily when presented to [`SessionManager::authorize`].

use crate::audit::{AuditLogger, SecurityEvent};
use crate::throttle::LoginThrottle;
use crate::SecurityConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sharenet_types::PeerId;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("missing, unknown or expired session token")]
    Unauthenticated,
    #[error("too many failed login attempts, retry in {retry_after_secs}s")]
    TooManyAttempts { retry_after_secs: u64 },
}

/// The credentials a peer is configured with.
#[derive(Clone)]
pub struct Identity {
    peer_id: PeerId,
    username: String,
    password_digest: blake3::Hash,
}

impl Identity {
    pub fn new(peer_id: PeerId, username: impl Into<String>, password: &str) -> Self {
        Self {
            peer_id,
            username: username.into(),
            password_digest: blake3::hash(password.as_bytes()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn matches(&self, peer_id: &str, username: &str, password: &str) -> bool {
        // blake3::Hash equality is constant-time.
        let password_ok = blake3::hash(password.as_bytes()) == self.password_digest;
        let peer_ok = self.peer_id.as_str() == peer_id.trim();
        let user_ok = self.username == username;
        password_ok & peer_ok & user_ok
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// An issued session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub token: String,
    pub peer_id: PeerId,
    pub username: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            peer_id: self.peer_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Who a validated token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub peer_id: PeerId,
    pub username: String,
}

#[derive(Default)]
struct SessionTable {
    by_token: HashMap<String, Session>,
    by_peer: HashMap<PeerId, String>,
}

impl SessionTable {
    fn remove(&mut self, token: &str) -> Option<Session> {
        let session = self.by_token.remove(token)?;
        if self.by_peer.get(&session.peer_id).map(String::as_str) == Some(token) {
            self.by_peer.remove(&session.peer_id);
        }
        Some(session)
    }
}

/// In-memory session table for one peer.
pub struct SessionManager {
    identity: Identity,
    ttl: Option<Duration>,
    throttle: LoginThrottle,
    audit: AuditLogger,
    sessions: RwLock<SessionTable>,
}

impl SessionManager {
    pub fn new(identity: Identity, config: &SecurityConfig) -> Self {
        let ttl = (config.session_ttl_secs > 0)
            .then(|| Duration::seconds(config.session_ttl_secs.min(i64::MAX as u64) as i64));
        Self {
            identity,
            ttl,
            throttle: LoginThrottle::new(config.max_login_attempts, config.lockout_secs),
            audit: AuditLogger::new(),
            sessions: RwLock::new(SessionTable::default()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn login(&self, peer_id: &str, username: &str, password: &str) -> Result<Session, AuthError> {
        self.login_at(peer_id, username, password, Utc::now())
    }

    pub fn login_at(
        &self,
        peer_id: &str,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let key = peer_id.trim();
        if let Err(remaining) = self.throttle.check_at(key, now) {
            let retry_after_secs = remaining.num_seconds().max(1) as u64;
            self.audit.record(SecurityEvent::LoginLockedOut {
                peer_id: key.to_string(),
                retry_after_secs,
            });
            return Err(AuthError::TooManyAttempts { retry_after_secs });
        }

        if !self.identity.matches(peer_id, username, password) {
            let attempt_count = self.throttle.record_failure_at(key, now);
            self.audit.record(SecurityEvent::LoginFailed {
                peer_id: key.to_string(),
                attempt_count,
            });
            return Err(AuthError::InvalidCredentials);
        }
        self.throttle.reset(key);

        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            peer_id: self.identity.peer_id.clone(),
            username: self.identity.username.clone(),
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };

        let superseded_previous = {
            let mut table = self.sessions.write();
            let previous = table
                .by_peer
                .insert(session.peer_id.clone(), session.token.clone());
            if let Some(old) = &previous {
                table.by_token.remove(old);
            }
            table.by_token.insert(session.token.clone(), session.clone());
            previous.is_some()
        };

        self.audit.record(SecurityEvent::LoginSucceeded {
            peer_id: session.peer_id.to_string(),
            superseded_previous,
        });
        Ok(session)
    }

    pub fn authorize(&self, token: &str) -> Result<SessionInfo, AuthError> {
        self.authorize_at(token, Utc::now())
    }

    pub fn authorize_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionInfo, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        {
            let table = self.sessions.read();
            match table.by_token.get(token) {
                None => return Err(AuthError::Unauthenticated),
                Some(session) if !session.is_expired_at(now) => return Ok(session.info()),
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, re-checking in case of a racing logout.
        let mut table = self.sessions.write();
        if let Some(session) = table.by_token.get(token) {
            if session.is_expired_at(now) {
                if let Some(expired) = table.remove(token) {
                    debug!("evicted expired session for {}", expired.peer_id);
                    self.audit.record(SecurityEvent::SessionExpired {
                        peer_id: expired.peer_id.to_string(),
                    });
                }
            } else {
                return Ok(session.info());
            }
        }
        Err(AuthError::Unauthenticated)
    }

    pub fn logout(&self, token: &str) -> Result<SessionInfo, AuthError> {
        let removed = self.sessions.write().remove(token);
        match removed {
            Some(session) => {
                self.audit.record(SecurityEvent::LoggedOut {
                    peer_id: session.peer_id.to_string(),
                });
                Ok(session.info())
            }
            None => Err(AuthError::Unauthenticated),
        }
    }

    /// Number of sessions that have not expired yet.
    pub fn active_sessions(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .by_token
            .values()
            .filter(|s| !s.is_expired_at(now))
            .count()
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl_secs: u64, max_attempts: u32) -> SessionManager {
        let identity = Identity::new(PeerId::parse("peer1").unwrap(), "alice", "s3cret");
        SessionManager::new(
            identity,
            &SecurityConfig {
                session_ttl_secs: ttl_secs,
                max_login_attempts: max_attempts,
                lockout_secs: 60,
            },
        )
    }

    #[test]
    fn login_then_authorize() {
        let sessions = manager(0, 5);
        let session = sessions.login("peer1", "alice", "s3cret").unwrap();
        assert!(session.expires_at.is_none());

        let info = sessions.authorize(&session.token).unwrap();
        assert_eq!(info.peer_id.as_str(), "peer1");
        assert_eq!(info.username, "alice");
        assert_eq!(sessions.active_sessions(), 1);
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let sessions = manager(0, 5);
        assert_eq!(
            sessions.login("peer1", "alice", "nope").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            sessions.login("peer2", "alice", "s3cret").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            sessions.login("peer1", "bob", "s3cret").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[test]
    fn unknown_or_empty_token_is_unauthenticated() {
        let sessions = manager(0, 5);
        assert_eq!(sessions.authorize(""), Err(AuthError::Unauthenticated));
        assert_eq!(sessions.authorize("deadbeef"), Err(AuthError::Unauthenticated));
    }

    #[test]
    fn logout_revokes_token() {
        let sessions = manager(0, 5);
        let session = sessions.login("peer1", "alice", "s3cret").unwrap();
        sessions.logout(&session.token).unwrap();
        assert_eq!(
            sessions.authorize(&session.token),
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(
            sessions.logout(&session.token),
            Err(AuthError::Unauthenticated)
        );
    }

    #[test]
    fn new_login_supersedes_previous_session() {
        let sessions = manager(0, 5);
        let first = sessions.login("peer1", "alice", "s3cret").unwrap();
        let second = sessions.login("peer1", "alice", "s3cret").unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(sessions.authorize(&first.token), Err(AuthError::Unauthenticated));
        assert!(sessions.authorize(&second.token).is_ok());
        assert_eq!(sessions.active_sessions(), 1);
    }

    #[test]
    fn sessions_expire_lazily() {
        let sessions = manager(30, 5);
        let t0 = Utc::now();
        let session = sessions.login_at("peer1", "alice", "s3cret", t0).unwrap();
        assert_eq!(session.expires_at, Some(t0 + Duration::seconds(30)));

        assert!(sessions
            .authorize_at(&session.token, t0 + Duration::seconds(29))
            .is_ok());
        assert_eq!(
            sessions.authorize_at(&session.token, t0 + Duration::seconds(30)),
            Err(AuthError::Unauthenticated)
        );
        // Evicted, so even an earlier clock no longer finds it.
        assert_eq!(
            sessions.authorize_at(&session.token, t0),
            Err(AuthError::Unauthenticated)
        );
    }

    #[test]
    fn repeated_failures_lock_out_even_correct_password() {
        let sessions = manager(0, 2);
        let t0 = Utc::now();
        for _ in 0..2 {
            assert_eq!(
                sessions.login_at("peer1", "alice", "bad", t0),
                Err(AuthError::InvalidCredentials)
            );
        }
        let err = sessions
            .login_at("peer1", "alice", "s3cret", t0 + Duration::seconds(1))
            .unwrap_err();
        assert_eq!(err, AuthError::TooManyAttempts { retry_after_secs: 59 });

        assert!(sessions
            .login_at("peer1", "alice", "s3cret", t0 + Duration::seconds(61))
            .is_ok());
    }

    #[test]
    fn identity_debug_hides_password() {
        let identity = Identity::new(PeerId::parse("peer1").unwrap(), "alice", "s3cret");
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }
}
