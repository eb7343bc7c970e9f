use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit logger for authentication and authorization events.
///
/// Events are emitted on the `sharenet::audit` tracing target so operators can
/// route them separately from request logs.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn record(&self, event: SecurityEvent) {
        let entry = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: event.severity(),
            details: event,
        };
        let rendered = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(err) => format!("{:?} (unserializable: {err})", entry.details),
        };

        match entry.severity {
            "medium" | "high" => warn!(target: "sharenet::audit", "{}", rendered),
            _ => info!(target: "sharenet::audit", "{}", rendered),
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditEvent {
    id: Uuid,
    timestamp: DateTime<Utc>,
    severity: &'static str,
    details: SecurityEvent,
}

/// Security-relevant events on a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SecurityEvent {
    LoginSucceeded {
        peer_id: String,
        superseded_previous: bool,
    },
    LoginFailed {
        peer_id: String,
        attempt_count: u32,
    },
    LoginLockedOut {
        peer_id: String,
        retry_after_secs: u64,
    },
    SessionExpired {
        peer_id: String,
    },
    LoggedOut {
        peer_id: String,
    },
    UnauthorizedAccess {
        endpoint: String,
        reason: String,
    },
    UploadRejected {
        peer_id: String,
        filename: String,
        reason: String,
    },
}

impl SecurityEvent {
    pub fn severity(&self) -> &'static str {
        match self {
            SecurityEvent::LoginLockedOut { .. } => "high",
            SecurityEvent::LoginFailed { .. }
            | SecurityEvent::UnauthorizedAccess { .. }
            | SecurityEvent::UploadRejected { .. } => "medium",
            SecurityEvent::LoginSucceeded { .. }
            | SecurityEvent::SessionExpired { .. }
            | SecurityEvent::LoggedOut { .. } => "low",
        }
    }
}
