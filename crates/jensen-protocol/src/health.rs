//! Connection health tracking and the recovery ladder.
//!
//! [`ConnectionStats`] is a running tally the façade updates after every
//! command; [`DeviceHealth`] is the derived, point-in-time snapshot a
//! caller polls. Recovery itself (soft reset, then disconnect/reconnect)
//! lives in [`crate::device`] since it needs the transport handle —
//! this module only decides *whether* a reset is warranted.

use std::time::{Duration, Instant};

/// Running counters the façade feeds after every command attempt.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub commands_sent: u64,
    pub responses_received: u64,
    pub bytes_transferred: u64,
    pub last_operation_duration: Option<Duration>,
    pub connected_since: Option<Instant>,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            commands_sent: 0,
            responses_received: 0,
            bytes_transferred: 0,
            last_operation_duration: None,
            connected_since: None,
        }
    }
}

impl ConnectionStats {
    pub fn record_success(&mut self, bytes: u64, duration: Duration) {
        self.commands_sent += 1;
        self.responses_received += 1;
        self.bytes_transferred += bytes;
        self.last_operation_duration = Some(duration);
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.commands_sent += 1;
        self.last_operation_duration = Some(duration);
    }

    pub fn reset(&mut self) {
        *self = ConnectionStats {
            connected_since: Some(Instant::now()),
            ..Default::default()
        };
    }

    /// `(commands_sent - responses_received) / max(1, commands_sent)`.
    pub fn error_rate(&self) -> f64 {
        let denominator = self.commands_sent.max(1) as f64;
        (self.commands_sent.saturating_sub(self.responses_received)) as f64 / denominator
    }
}

/// Coarse health tag derived from [`ConnectionStats::error_rate`]:
/// `healthy` at or below 0.05, `warning` at or below 0.1, `error`
/// otherwise, overridden to `disconnected` whenever the transport isn't
/// open regardless of the error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct DeviceHealth {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub stats: ConnectionStatsSnapshot,
}

/// A `Copy`-friendly snapshot of [`ConnectionStats`] for reporting,
/// since `Instant`s in the live struct aren't meaningful to a caller.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStatsSnapshot {
    pub commands_sent: u64,
    pub responses_received: u64,
    pub bytes_transferred: u64,
    pub last_operation_duration: Option<Duration>,
    pub uptime: Option<Duration>,
}

const HEALTHY_ERROR_RATE: f64 = 0.05;
const WARNING_ERROR_RATE: f64 = 0.1;

pub fn assess(stats: &ConnectionStats, connected: bool) -> DeviceHealth {
    let error_rate = stats.error_rate();

    let status = if !connected {
        HealthStatus::Disconnected
    } else if error_rate <= HEALTHY_ERROR_RATE {
        HealthStatus::Healthy
    } else if error_rate <= WARNING_ERROR_RATE {
        HealthStatus::Warning
    } else {
        HealthStatus::Error
    };

    DeviceHealth {
        status,
        error_rate,
        stats: ConnectionStatsSnapshot {
            commands_sent: stats.commands_sent,
            responses_received: stats.responses_received,
            bytes_transferred: stats.bytes_transferred,
            last_operation_duration: stats.last_operation_duration,
            uptime: stats.connected_since.map(|t| t.elapsed()),
        },
    }
}

/// The next step the recovery ladder should take given how many
/// recovery attempts have already been made this call (a soft
/// reset first, then a full disconnect/reconnect with a forced USB
/// reset, then give up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    SoftReset,
    ReconnectWithForcedReset,
    GiveUp,
}

pub fn next_recovery_step(attempts_so_far: u32) -> RecoveryStep {
    match attempts_so_far {
        0 => RecoveryStep::SoftReset,
        1 => RecoveryStep::ReconnectWithForcedReset,
        _ => RecoveryStep::GiveUp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_is_zero_with_no_attempts() {
        let stats = ConnectionStats::default();
        assert_eq!(stats.error_rate(), 0.0);
    }

    #[test]
    fn error_rate_counts_unanswered_commands() {
        let mut stats = ConnectionStats::default();
        stats.record_success(10, Duration::from_millis(5));
        stats.record_failure(Duration::from_millis(5));
        stats.record_failure(Duration::from_millis(5));
        assert!((stats.error_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn disconnected_overrides_error_rate() {
        let stats = ConnectionStats::default();
        let health = assess(&stats, false);
        assert_eq!(health.status, HealthStatus::Disconnected);
    }

    #[test]
    fn low_error_rate_is_healthy() {
        let mut stats = ConnectionStats::default();
        for _ in 0..20 {
            stats.record_success(0, Duration::from_millis(1));
        }
        let health = assess(&stats, true);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn moderate_error_rate_is_warning() {
        let mut stats = ConnectionStats::default();
        for _ in 0..9 {
            stats.record_success(0, Duration::from_millis(1));
        }
        stats.record_failure(Duration::from_millis(1));
        let health = assess(&stats, true);
        assert_eq!(health.status, HealthStatus::Warning);
    }

    #[test]
    fn high_error_rate_is_flagged_as_error() {
        let mut stats = ConnectionStats::default();
        for _ in 0..5 {
            stats.record_failure(Duration::from_millis(1));
        }
        let health = assess(&stats, true);
        assert_eq!(health.status, HealthStatus::Error);
    }

    #[test]
    fn recovery_ladder_escalates_then_gives_up() {
        assert_eq!(next_recovery_step(0), RecoveryStep::SoftReset);
        assert_eq!(next_recovery_step(1), RecoveryStep::ReconnectWithForcedReset);
        assert_eq!(next_recovery_step(2), RecoveryStep::GiveUp);
    }
}
