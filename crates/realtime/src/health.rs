//! Connection health monitor — the push channel's state machine.
//!
//! Pure state: no timers, no I/O. The connection manager feeds it outcomes
//! (connected, failed, heartbeat) and acts on what it returns.
//!
//! ```text
//! disconnected --initialize--> connecting --success--> connected
//!      ^                            ^                      |
//!      |                            |               heartbeat missed
//!  exhausted                  reconnect (backoff)          |
//!      |                            |                      v
//!      +--------------------------- error <----- any failure
//! ```
//!
//! Failures are counted, never classified: a refused subscription, a closed
//! listener, a missed heartbeat and a failed poll all weigh the same.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use tidings_common::config::RealtimeConfig;
use tidings_common::types::{ConnectionHealth, ConnectionStatus, ConnectionStatusEvent};

/// Thresholds that drive the state machine.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub max_reconnect_attempts: u32,
    pub max_errors_before_fallback: u32,
    pub reconnect_base_delay: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&RealtimeConfig> for HealthPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_errors_before_fallback: config.max_errors_before_fallback,
            reconnect_base_delay: config.reconnect_base_delay,
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// What the manager should do about the channel after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Try the push channel again after `delay`.
    Reconnect { delay: Duration },
    /// Attempts used up: give up on push until a forced refresh.
    Exhausted,
    /// Already exhausted; nothing more to schedule.
    Idle,
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub recovery: Recovery,
    /// This failure switched the fallback poller on.
    pub activate_fallback: bool,
}

/// In-memory health state of one push connection.
#[derive(Debug)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    health: ConnectionHealth,
    /// Monotonic twin of `health.last_heartbeat`, used for timeout checks.
    last_heartbeat_at: Option<Instant>,
    exhausted: bool,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            health: ConnectionHealth::default(),
            last_heartbeat_at: None,
            exhausted: false,
        }
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        self.health.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.health.status
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn status_event(&self, error: Option<String>) -> ConnectionStatusEvent {
        ConnectionStatusEvent {
            status: self.health.status,
            error,
            fallback_active: self.health.fallback_active,
        }
    }

    /// First subscription attempt of a session.
    pub fn begin_connect(&mut self) {
        self.health.status = ConnectionStatus::Connecting;
    }

    /// A scheduled reconnect is firing.
    pub fn begin_reconnect(&mut self) {
        self.health.reconnect_attempts += 1;
        self.health.status = ConnectionStatus::Connecting;
    }

    /// The channel is live. Returns `true` when the fallback poller should stop.
    pub fn record_connected(&mut self, now: Instant) -> bool {
        self.health.status = ConnectionStatus::Connected;
        self.health.last_heartbeat = Some(Utc::now());
        self.last_heartbeat_at = Some(now);
        self.health.reconnect_attempts = 0;
        self.health.error_count = 0;

        if self.health.fallback_active && !self.exhausted {
            self.health.fallback_active = false;
            return true;
        }
        false
    }

    /// The channel proved it is alive. Clears the error count.
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.health.last_heartbeat = Some(Utc::now());
        self.last_heartbeat_at = Some(now);
        self.health.error_count = 0;
    }

    /// Record any failure and decide how to recover.
    pub fn record_failure(&mut self) -> FailureOutcome {
        self.health.error_count += 1;

        if self.exhausted {
            return FailureOutcome {
                recovery: Recovery::Idle,
                activate_fallback: false,
            };
        }

        self.health.status = ConnectionStatus::Error;

        let mut activate_fallback = false;
        if self.health.error_count >= self.policy.max_errors_before_fallback
            && !self.health.fallback_active
        {
            self.health.fallback_active = true;
            activate_fallback = true;
        }

        if self.health.reconnect_attempts < self.policy.max_reconnect_attempts {
            return FailureOutcome {
                recovery: Recovery::Reconnect {
                    delay: self.backoff_delay(),
                },
                activate_fallback,
            };
        }

        self.exhausted = true;
        self.health.status = ConnectionStatus::Disconnected;
        self.health.active_channels = 0;
        if !self.health.fallback_active {
            self.health.fallback_active = true;
            activate_fallback = true;
        }

        FailureOutcome {
            recovery: Recovery::Exhausted,
            activate_fallback,
        }
    }

    /// Time since the last heartbeat if it exceeds the timeout while connected.
    pub fn heartbeat_overdue(&self, now: Instant) -> Option<Duration> {
        if self.health.status != ConnectionStatus::Connected {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_heartbeat_at?);
        (elapsed > self.policy.heartbeat_timeout).then_some(elapsed)
    }

    pub fn set_active_channels(&mut self, count: usize) {
        self.health.active_channels = count;
    }

    /// Back to the initial state.
    pub fn reset(&mut self) {
        self.health = ConnectionHealth::default();
        self.last_heartbeat_at = None;
        self.exhausted = false;
    }

    /// `base * 2^attempts`, saturating.
    fn backoff_delay(&self) -> Duration {
        let factor = 1u32
            .checked_shl(self.health.reconnect_attempts)
            .unwrap_or(u32::MAX);
        self.policy.reconnect_base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthPolicy::from(&RealtimeConfig::default()))
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let health = monitor().snapshot();
        assert_eq!(health.status, ConnectionStatus::Disconnected);
        assert_eq!(health.reconnect_attempts, 0);
        assert_eq!(health.error_count, 0);
        assert!(!health.fallback_active);
        assert!(health.last_heartbeat.is_none());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let mut monitor = monitor();
        monitor.begin_connect();

        let mut delays = Vec::new();
        loop {
            match monitor.record_failure().recovery {
                Recovery::Reconnect { delay } => {
                    delays.push(delay.as_secs());
                    monitor.begin_reconnect();
                }
                Recovery::Exhausted => break,
                Recovery::Idle => panic!("idle before exhaustion"),
            }
        }

        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
        let health = monitor.snapshot();
        assert_eq!(health.reconnect_attempts, 5);
        assert_eq!(health.status, ConnectionStatus::Disconnected);
        assert!(health.fallback_active);
        assert!(monitor.is_exhausted());
    }

    #[test]
    fn test_fallback_activates_on_third_error() {
        let mut monitor = monitor();
        monitor.begin_connect();

        assert!(!monitor.record_failure().activate_fallback);
        assert!(!monitor.record_failure().activate_fallback);
        let third = monitor.record_failure();
        assert!(third.activate_fallback);
        assert!(matches!(third.recovery, Recovery::Reconnect { .. }));
        assert_eq!(monitor.status(), ConnectionStatus::Error);

        // Already active: not re-announced.
        assert!(!monitor.record_failure().activate_fallback);
    }

    #[test]
    fn test_success_resets_counters_and_stops_fallback() {
        let mut monitor = monitor();
        monitor.begin_connect();
        for _ in 0..3 {
            monitor.record_failure();
        }
        monitor.begin_reconnect();

        assert!(monitor.record_connected(Instant::now()));
        let health = monitor.snapshot();
        assert_eq!(health.status, ConnectionStatus::Connected);
        assert_eq!(health.reconnect_attempts, 0);
        assert_eq!(health.error_count, 0);
        assert!(!health.fallback_active);
        assert!(health.last_heartbeat.is_some());
    }

    #[test]
    fn test_exhausted_failures_schedule_nothing() {
        let mut monitor = monitor();
        monitor.begin_connect();
        while monitor.record_failure().recovery != Recovery::Exhausted {
            monitor.begin_reconnect();
        }

        let outcome = monitor.record_failure();
        assert_eq!(outcome.recovery, Recovery::Idle);
        assert!(!outcome.activate_fallback);
        assert_eq!(monitor.status(), ConnectionStatus::Disconnected);

        monitor.reset();
        assert!(!monitor.is_exhausted());
        assert_eq!(monitor.snapshot(), ConnectionHealth::default());
    }

    #[test]
    fn test_heartbeat_overdue_only_past_twice_interval() {
        let mut monitor = monitor();
        let start = Instant::now();
        assert!(monitor.heartbeat_overdue(start).is_none());

        monitor.begin_connect();
        monitor.record_connected(start);

        assert!(monitor.heartbeat_overdue(start + Duration::from_secs(60)).is_none());
        assert_eq!(
            monitor.heartbeat_overdue(start + Duration::from_secs(61)),
            Some(Duration::from_secs(61))
        );

        monitor.record_heartbeat(start + Duration::from_secs(45));
        assert!(monitor.heartbeat_overdue(start + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn test_heartbeat_clears_error_count() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.begin_connect();
        monitor.record_connected(start);
        monitor.record_failure();
        monitor.record_failure();
        assert_eq!(monitor.snapshot().error_count, 2);

        monitor.record_heartbeat(start + Duration::from_secs(5));
        assert_eq!(monitor.snapshot().error_count, 0);
    }

    #[test]
    fn test_heartbeat_not_checked_unless_connected() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.begin_connect();
        monitor.record_connected(start);
        monitor.record_failure();

        assert!(monitor.heartbeat_overdue(start + Duration::from_secs(600)).is_none());
    }
}
