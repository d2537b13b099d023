//! Protocol thresholds for a single tunnel
//!
//! Defaults are the WireGuard constants. Tests and simulations shrink them
//! to exercise rekey and exhaustion paths quickly.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Timing, volume and queueing limits for one [`crate::Tunn`]
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Optional symmetric key mixed into the handshake
    pub preshared_key: Option<[u8; 32]>,
    /// Send a keepalive after this much silence on our side
    pub persistent_keepalive: Option<Duration>,
    pub rekey_after_time: Duration,
    pub reject_after_time: Duration,
    pub rekey_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub dead_peer_timeout: Duration,
    pub cookie_lifetime: Duration,
    /// Upper bound of the random delay added to handshake retries
    pub max_jitter: Duration,
    /// Initiations sent in one attempt before the link is declared down
    pub max_handshake_attempts: u32,
    pub rekey_after_messages: u64,
    pub reject_after_messages: u64,
    /// Handshake messages per second above which we demand cookies
    pub handshake_rate_limit: u32,
    /// Packets held while no session is available
    pub queue_depth: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            preshared_key: None,
            persistent_keepalive: None,
            rekey_after_time: Duration::from_secs(120),
            reject_after_time: Duration::from_secs(180),
            rekey_timeout: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(10),
            dead_peer_timeout: Duration::from_secs(540),
            cookie_lifetime: Duration::from_secs(120),
            max_jitter: Duration::from_millis(333),
            max_handshake_attempts: 18,
            rekey_after_messages: 1 << 60,
            reject_after_messages: u64::MAX - (1 << 13),
            handshake_rate_limit: 10,
            queue_depth: 256,
        }
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("preshared_key", &self.preshared_key.map(|_| "[redacted]"))
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("rekey_after_time", &self.rekey_after_time)
            .field("reject_after_time", &self.reject_after_time)
            .field("rekey_timeout", &self.rekey_timeout)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("dead_peer_timeout", &self.dead_peer_timeout)
            .field("cookie_lifetime", &self.cookie_lifetime)
            .field("max_jitter", &self.max_jitter)
            .field("max_handshake_attempts", &self.max_handshake_attempts)
            .field("rekey_after_messages", &self.rekey_after_messages)
            .field("reject_after_messages", &self.reject_after_messages)
            .field("handshake_rate_limit", &self.handshake_rate_limit)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl TunnelConfig {
    /// Check that the thresholds are mutually consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rekey_timeout.is_zero() {
            return Err(invalid("rekey_timeout", "must be positive"));
        }
        if self.keepalive_timeout.is_zero() {
            return Err(invalid("keepalive_timeout", "must be positive"));
        }
        if self.rekey_after_time >= self.reject_after_time {
            return Err(invalid(
                "rekey_after_time",
                "must be less than reject_after_time",
            ));
        }
        if self.reject_after_time <= self.keepalive_timeout + self.rekey_timeout {
            return Err(invalid(
                "reject_after_time",
                "must exceed keepalive_timeout + rekey_timeout",
            ));
        }
        if self.dead_peer_timeout < self.reject_after_time {
            return Err(invalid(
                "dead_peer_timeout",
                "must be at least reject_after_time",
            ));
        }
        if self.cookie_lifetime.is_zero() {
            return Err(invalid("cookie_lifetime", "must be positive"));
        }
        if self.max_handshake_attempts == 0 {
            return Err(invalid("max_handshake_attempts", "must be at least 1"));
        }
        if self.rekey_after_messages > self.reject_after_messages {
            return Err(invalid(
                "rekey_after_messages",
                "must not exceed reject_after_messages",
            ));
        }
        if self.queue_depth == 0 {
            return Err(invalid("queue_depth", "must be at least 1"));
        }
        if self.persistent_keepalive.map_or(false, |d| d.is_zero()) {
            return Err(invalid(
                "persistent_keepalive",
                "must be positive when set",
            ));
        }
        Ok(())
    }

    /// Responder-created sessions rekey this old, ahead of the initiator's limit
    pub fn responder_rekey_after(&self) -> Duration {
        self.reject_after_time - self.keepalive_timeout - self.rekey_timeout
    }
}
