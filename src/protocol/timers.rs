//! Timer and retry policy
//!
//! [`Timers`] records when things happened; [`Timers::evaluate`] turns
//! that record into at most one thing to do on a tick. It never mutates
//! anything, so calling it twice at the same instant gives the same answer.

use std::time::Duration;

use rand::Rng;

use crate::config::TunnelConfig;
use crate::protocol::handshake::Role;

/// What a tick should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Nothing,
    /// Give up: clear all state and report the link down
    ConnectionExpired,
    /// Re-send the initiation of the attempt in progress
    RetryHandshake,
    /// Begin a new handshake attempt
    StartHandshake,
    SendKeepalive,
}

/// The current session as far as timers care
#[derive(Debug, Clone, Copy)]
pub struct SessionView {
    pub age: Duration,
    pub role: Role,
    pub sending_counter: u64,
}

fn elapsed(now: Duration, since: Option<Duration>) -> Option<Duration> {
    since.map(|t| now.saturating_sub(t))
}

/// Timestamps relative to tunnel creation
#[derive(Debug, Clone, Default)]
pub struct Timers {
    pub handshake_completed: Option<Duration>,
    /// Any authenticated packet, handshake or data
    pub last_received: Option<Duration>,
    pub last_data_received: Option<Duration>,
    /// Any packet, handshake or data
    pub last_sent: Option<Duration>,
    pub last_data_sent: Option<Duration>,
    pub last_handshake_sent: Option<Duration>,
    /// Set while a handshake attempt is active
    pub attempt_started: Option<Duration>,
    /// Initiations sent in the current attempt
    pub attempts: u32,
    /// Random delay added before the next retry
    pub jitter: Duration,
    /// Completed as initiator and the peer has not yet seen our keys in use
    pub confirmation_pending: bool,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_active(&self) -> bool {
        self.attempt_started.is_some()
    }

    /// An initiation went out. `retry` is false for the first of an attempt.
    pub fn on_initiation_sent(&mut self, now: Duration, retry: bool, max_jitter: Duration) {
        if !retry || self.attempt_started.is_none() {
            self.attempt_started = Some(now);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.last_handshake_sent = Some(now);
        self.jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=max_jitter)
        };
        self.on_packet_sent(now, false);
    }

    pub fn on_handshake_complete(&mut self, now: Duration, role: Role) {
        self.handshake_completed = Some(now);
        self.attempt_started = None;
        self.attempts = 0;
        self.confirmation_pending = role == Role::Initiator;
    }

    pub fn on_packet_sent(&mut self, now: Duration, data: bool) {
        self.last_sent = Some(now);
        if data {
            self.last_data_sent = Some(now);
            self.confirmation_pending = false;
        }
    }

    /// A keepalive counts as sent traffic and confirms the session
    pub fn on_keepalive_sent(&mut self, now: Duration) {
        self.last_sent = Some(now);
        self.confirmation_pending = false;
    }

    pub fn on_packet_received(&mut self, now: Duration, data: bool) {
        self.last_received = Some(now);
        if data {
            self.last_data_received = Some(now);
        }
    }

    /// Forget everything (link down or explicit reset)
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Decide what a tick at `now` should do.
    ///
    /// `current` describes the current session. Session expiry happens
    /// before this is called, so the dead-peer rule keys off the last
    /// completed handshake rather than the surviving slots.
    pub fn evaluate(
        &self,
        now: Duration,
        current: Option<SessionView>,
        config: &TunnelConfig,
    ) -> TimerAction {
        let since_handshake_sent = elapsed(now, self.last_handshake_sent);

        // Attempts used up and the last one timed out
        if self.attempt_active()
            && self.attempts >= config.max_handshake_attempts
            && since_handshake_sent.map_or(true, |d| d >= config.rekey_timeout)
        {
            return TimerAction::ConnectionExpired;
        }

        // Dead peer: a link was up and the peer has been silent since
        if let Some(completed) = self.handshake_completed {
            let heard = self.last_received.map_or(completed, |r| r.max(completed));
            if now.saturating_sub(heard) >= config.dead_peer_timeout {
                return TimerAction::ConnectionExpired;
            }
        }

        if self.attempt_active() {
            if since_handshake_sent.map_or(true, |d| d >= config.rekey_timeout + self.jitter) {
                return TimerAction::RetryHandshake;
            }
        } else {
            // Rekey by age or volume
            if let Some(session) = current {
                let limit = match session.role {
                    Role::Initiator => config.rekey_after_time,
                    Role::Responder => config.responder_rekey_after(),
                };
                if session.age >= limit || session.sending_counter >= config.rekey_after_messages {
                    return TimerAction::StartHandshake;
                }
            }

            // Sent data, heard nothing back
            if let Some(data_sent) = self.last_data_sent {
                let heard_since = self.last_received.map_or(false, |r| r >= data_sent);
                if !heard_since
                    && now.saturating_sub(data_sent) >= config.keepalive_timeout + config.rekey_timeout
                {
                    return TimerAction::StartHandshake;
                }
            }
        }

        if current.is_some() {
            if self.confirmation_pending {
                return TimerAction::SendKeepalive;
            }

            if let Some(data_received) = self.last_data_received {
                let sent_since = self.last_sent.map_or(false, |s| s >= data_received);
                if !sent_since && now.saturating_sub(data_received) >= config.keepalive_timeout {
                    return TimerAction::SendKeepalive;
                }
            }

            if let Some(interval) = config.persistent_keepalive {
                let quiet = elapsed(now, self.last_sent.or(self.handshake_completed));
                if quiet.map_or(false, |d| d >= interval) {
                    return TimerAction::SendKeepalive;
                }
            }
        }

        TimerAction::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            max_jitter: Duration::ZERO,
            ..TunnelConfig::default()
        }
    }

    fn view(age: u64, role: Role) -> Option<SessionView> {
        Some(SessionView {
            age: secs(age),
            role,
            sending_counter: 0,
        })
    }

    #[test]
    fn test_idle_does_nothing() {
        let timers = Timers::new();
        assert_eq!(
            timers.evaluate(secs(1000), None, &config()),
            TimerAction::Nothing
        );
    }

    #[test]
    fn test_retry_after_rekey_timeout() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_initiation_sent(secs(0), false, cfg.max_jitter);

        assert_eq!(timers.evaluate(secs(4), None, &cfg), TimerAction::Nothing);
        assert_eq!(
            timers.evaluate(secs(5), None, &cfg),
            TimerAction::RetryHandshake
        );

        timers.on_initiation_sent(secs(5), true, cfg.max_jitter);
        assert_eq!(timers.attempts, 2);
        assert_eq!(timers.evaluate(secs(5), None, &cfg), TimerAction::Nothing);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let cfg = config();
        let mut timers = Timers::new();
        let mut now = secs(0);
        timers.on_initiation_sent(now, false, cfg.max_jitter);
        for _ in 1..cfg.max_handshake_attempts {
            now += cfg.rekey_timeout;
            assert_eq!(
                timers.evaluate(now, None, &cfg),
                TimerAction::RetryHandshake
            );
            timers.on_initiation_sent(now, true, cfg.max_jitter);
        }

        now += cfg.rekey_timeout;
        assert_eq!(
            timers.evaluate(now, None, &cfg),
            TimerAction::ConnectionExpired
        );
        assert_eq!(now, secs(90));
    }

    #[test]
    fn test_rekey_by_role() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(0), Role::Responder);
        timers.on_packet_received(secs(119), true);
        timers.on_packet_sent(secs(119), true);

        assert_eq!(
            timers.evaluate(secs(120), view(120, Role::Initiator), &cfg),
            TimerAction::StartHandshake
        );
        assert_eq!(
            timers.evaluate(secs(120), view(120, Role::Responder), &cfg),
            TimerAction::Nothing
        );
        assert_eq!(
            timers.evaluate(secs(165), view(165, Role::Responder), &cfg),
            TimerAction::StartHandshake
        );
    }

    #[test]
    fn test_rekey_by_volume() {
        let cfg = config();
        let timers = Timers::new();
        let current = Some(SessionView {
            age: secs(1),
            role: Role::Initiator,
            sending_counter: cfg.rekey_after_messages,
        });
        assert_eq!(
            timers.evaluate(secs(1), current, &cfg),
            TimerAction::StartHandshake
        );
    }

    #[test]
    fn test_confirmation_keepalive() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(1), Role::Initiator);
        timers.on_packet_received(secs(1), false);

        assert_eq!(
            timers.evaluate(secs(1), view(0, Role::Initiator), &cfg),
            TimerAction::SendKeepalive
        );
        timers.on_keepalive_sent(secs(1));
        assert_eq!(
            timers.evaluate(secs(1), view(0, Role::Initiator), &cfg),
            TimerAction::Nothing
        );
    }

    #[test]
    fn test_passive_keepalive() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(0), Role::Responder);
        timers.on_packet_received(secs(2), true);

        assert_eq!(
            timers.evaluate(secs(11), view(11, Role::Responder), &cfg),
            TimerAction::Nothing
        );
        assert_eq!(
            timers.evaluate(secs(12), view(12, Role::Responder), &cfg),
            TimerAction::SendKeepalive
        );
    }

    #[test]
    fn test_persistent_keepalive() {
        let cfg = TunnelConfig {
            persistent_keepalive: Some(secs(25)),
            ..config()
        };
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(0), Role::Responder);
        timers.on_packet_received(secs(0), false);
        timers.on_packet_sent(secs(0), false);

        assert_eq!(
            timers.evaluate(secs(24), view(24, Role::Responder), &cfg),
            TimerAction::Nothing
        );
        assert_eq!(
            timers.evaluate(secs(25), view(25, Role::Responder), &cfg),
            TimerAction::SendKeepalive
        );
    }

    #[test]
    fn test_stale_link_triggers_handshake() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(0), Role::Responder);
        timers.on_packet_received(secs(0), false);
        timers.on_packet_sent(secs(1), true);

        assert_eq!(
            timers.evaluate(secs(15), view(15, Role::Responder), &cfg),
            TimerAction::Nothing
        );
        assert_eq!(
            timers.evaluate(secs(16), view(16, Role::Responder), &cfg),
            TimerAction::StartHandshake
        );
    }

    #[test]
    fn test_dead_peer() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_handshake_complete(secs(0), Role::Initiator);
        timers.on_packet_received(secs(10), true);

        // Sessions are long expired by now; the completed handshake is what counts
        assert_eq!(
            timers.evaluate(secs(549), None, &cfg),
            TimerAction::Nothing
        );
        assert_eq!(
            timers.evaluate(secs(550), None, &cfg),
            TimerAction::ConnectionExpired
        );
    }

    #[test]
    fn test_no_dead_peer_without_handshake() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_packet_received(secs(0), false);
        assert_eq!(
            timers.evaluate(secs(10_000), None, &cfg),
            TimerAction::Nothing
        );
    }

    #[test]
    fn test_evaluate_is_pure() {
        let cfg = config();
        let mut timers = Timers::new();
        timers.on_initiation_sent(secs(0), false, cfg.max_jitter);
        let first = timers.evaluate(secs(7), None, &cfg);
        let second = timers.evaluate(secs(7), None, &cfg);
        assert_eq!(first, second);
    }
}
