//! Peer-side access control: sessions, login throttling, upload policy and
//! the security audit trail.

pub mod audit;
pub mod session;
pub mod throttle;
pub mod validation;

pub use audit::{AuditLogger, SecurityEvent};
pub use session::{AuthError, Identity, Session, SessionInfo, SessionManager};
pub use throttle::LoginThrottle;
pub use validation::{PolicyViolation, UploadPolicy};

use serde::{Deserialize, Serialize};

/// Security configuration for a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Session lifetime in seconds; 0 keeps sessions until logout.
    pub session_ttl_secs: u64,
    /// Consecutive failed logins before the peer id is locked out; 0 disables.
    pub max_login_attempts: u32,
    /// Lockout duration in seconds.
    pub lockout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            max_login_attempts: 5,
            lockout_secs: 300, // 5 minutes
        }
    }
}
