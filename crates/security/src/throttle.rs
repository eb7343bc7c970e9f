use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Counts failed logins per claimed peer id and locks the id out once
/// `max_attempts` is reached. A failure is forgotten once `lockout` has passed
/// since the id's last failure.
pub struct LoginThrottle {
    max_attempts: u32,
    lockout: Duration,
    failed_attempts: RwLock<HashMap<String, FailedLogins>>,
}

#[derive(Debug, Clone, Copy)]
struct FailedLogins {
    count: u32,
    last_failure: DateTime<Utc>,
}

impl LoginThrottle {
    /// `max_attempts == 0` disables throttling.
    pub fn new(max_attempts: u32, lockout_secs: u64) -> Self {
        Self {
            max_attempts,
            lockout: Duration::seconds(lockout_secs.min(i64::MAX as u64) as i64),
            failed_attempts: RwLock::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Returns the remaining lockout when `key` is currently blocked.
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), Duration> {
        if self.max_attempts == 0 {
            return Ok(());
        }
        let attempts = self.failed_attempts.read();
        match attempts.get(key) {
            Some(entry) if entry.count >= self.max_attempts => {
                let unlock_at = entry.last_failure + self.lockout;
                if now < unlock_at {
                    Err(unlock_at - now)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Record a failed attempt and return the consecutive failure count.
    ///
    /// Ids whose last failure is older than the lockout are forgotten first.
    pub fn record_failure_at(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let mut attempts = self.failed_attempts.write();
        Self::prune(&mut attempts, self.lockout, now);
        let entry = attempts.entry(key.to_string()).or_insert(FailedLogins {
            count: 0,
            last_failure: now,
        });
        // An expired lockout starts a fresh window.
        if self.max_attempts > 0
            && entry.count >= self.max_attempts
            && now >= entry.last_failure + self.lockout
        {
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.last_failure = now;
        entry.count
    }

    /// Drop entries that no longer block or count toward a lockout.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) {
        let mut attempts = self.failed_attempts.write();
        Self::prune(&mut attempts, self.lockout, now);
    }

    fn prune(attempts: &mut HashMap<String, FailedLogins>, lockout: Duration, now: DateTime<Utc>) {
        attempts.retain(|_, entry| now < entry.last_failure + lockout);
    }

    pub fn reset(&self, key: &str) {
        self.failed_attempts.write().remove(key);
    }

    /// Number of ids with outstanding failures.
    pub fn tracked(&self) -> usize {
        self.failed_attempts.read().len()
    }
}
