//! Keep-alive and timeout tracking for one session
//!
//! # Protocol
//!
//! 1. From accept, the client has `handshake_timeout` to reach `Ready`
//! 2. In `Ready`, after `ping_interval` without inbound traffic the server
//!    sends one `sys.ping`
//! 3. After `idle_timeout` without inbound traffic the session is closed
//!
//! Any inbound packet resets the idle timer. The tracker is pure: the session
//! loop feeds it instants and acts on the returned [`KeepaliveAction`].

use std::time::{Duration, Instant};

use super::state::SessionState;

/// Timeout configuration for sessions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Deadline from accept to `Ready` (default: 10 seconds)
    pub handshake_timeout: Duration,
    /// Inbound silence before the server pings (default: 30 seconds)
    pub ping_interval: Duration,
    /// Inbound silence before the session is closed (default: 90 seconds)
    pub idle_timeout: Duration,
    /// Whether ping and idle handling run (handshake timeout always applies)
    pub enabled: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            enabled: true,
        }
    }
}

impl KeepaliveConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable pings and idle timeout
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the ping interval
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Short timeouts for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(300),
            enabled: true,
        }
    }
}

/// What the session loop should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Nothing due; wake again at this instant (if any)
    Wait(Option<Instant>),
    /// Send a `sys.ping`
    SendPing,
    /// Handshake deadline passed
    HandshakeExpired,
    /// Idle deadline passed
    IdleExpired,
}

/// Per-session timer state
#[derive(Debug)]
pub struct Keepalive {
    config: KeepaliveConfig,
    started: Instant,
    last_activity: Instant,
    ping_sent: bool,
}

impl Keepalive {
    /// Start tracking at `now`
    #[must_use]
    pub fn new(config: KeepaliveConfig, now: Instant) -> Self {
        Self {
            config,
            started: now,
            last_activity: now,
            ping_sent: false,
        }
    }

    /// Record inbound traffic
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent = false;
    }

    /// Time since the last inbound packet
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Next instant at which [`Keepalive::poll`] may return something other
    /// than `Wait`
    #[must_use]
    pub fn next_deadline(&self, state: SessionState) -> Option<Instant> {
        if state.is_pre_ready() {
            return Some(self.started + self.config.handshake_timeout);
        }
        if !state.is_ready() || !self.config.enabled {
            return None;
        }
        let idle_deadline = self.last_activity + self.config.idle_timeout;
        if self.ping_sent {
            Some(idle_deadline)
        } else {
            Some(idle_deadline.min(self.last_activity + self.config.ping_interval))
        }
    }

    /// Evaluate the timers at `now`
    pub fn poll(&mut self, state: SessionState, now: Instant) -> KeepaliveAction {
        if state.is_pre_ready() {
            if now >= self.started + self.config.handshake_timeout {
                return KeepaliveAction::HandshakeExpired;
            }
            return KeepaliveAction::Wait(self.next_deadline(state));
        }
        if !state.is_ready() || !self.config.enabled {
            return KeepaliveAction::Wait(None);
        }
        if now >= self.last_activity + self.config.idle_timeout {
            return KeepaliveAction::IdleExpired;
        }
        if !self.ping_sent && now >= self.last_activity + self.config.ping_interval {
            self.ping_sent = true;
            return KeepaliveAction::SendPing;
        }
        KeepaliveAction::Wait(self.next_deadline(state))
    }
}
