//! Completion polling with a wall-clock budget
//!
//! - `timeout_minutes`: how long a job may take before polling gives up
//! - `poll_interval_seconds`: fixed delay between task-state checks
//!
//! The poll loop has no backoff. It stops when the probe reports ready, when
//! the deadline passes, or when the cancel token is set between iterations.
//! Time comes from a [`Clock`] so tests never really sleep.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::signal::CancelToken;

/// Polling configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Overall job budget in minutes (default: 30)
    pub timeout_minutes: u64,

    /// Delay between polls in seconds (default: 10)
    pub poll_interval_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            poll_interval_seconds: 10,
        }
    }
}

impl TimeoutConfig {
    /// Check bounds: timeout in (0, 10080] minutes, interval in [1, 300] seconds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if self.timeout_minutes == 0 || self.timeout_minutes > 10_080 {
            return Err(TimeoutValidationError::TimeoutOutOfBounds {
                value: self.timeout_minutes,
            });
        }

        if self.poll_interval_seconds == 0 || self.poll_interval_seconds > 300 {
            return Err(TimeoutValidationError::IntervalOutOfBounds {
                value: self.poll_interval_seconds,
            });
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutValidationError {
    #[error("timeout_minutes must be in (0, 10080], got {value}")]
    TimeoutOutOfBounds { value: u64 },

    #[error("poll_interval_seconds must be in [1, 300], got {value}")]
    IntervalOutOfBounds { value: u64 },
}

/// What a probe saw on one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Condition met
    Ready(T),
    /// Not yet; keep the observation in case the wait ends here
    Pending(T),
}

/// How a wait ended, with the most recent observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    /// Deadline reached; `None` if no probe ran before it
    TimedOut(Option<T>),
    Cancelled(Option<T>),
}

/// Bookkeeping for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStats {
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub polls: u32,
}

/// Poll `probe` every `interval` until ready, timed out or cancelled
///
/// A probe only counts as ready if it ran strictly before the deadline. The
/// last sleep is shortened so the loop wakes at the deadline instead of
/// overshooting it by up to one interval.
pub fn poll_until<T, E>(
    clock: &dyn Clock,
    cancel: &CancelToken,
    interval: Duration,
    timeout: Duration,
    mut probe: impl FnMut() -> Result<Probe<T>, E>,
) -> Result<(WaitOutcome<T>, WaitStats), E> {
    let started_at = clock.now();
    let budget = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    let deadline = started_at.checked_add_signed(budget).unwrap_or(DateTime::<Utc>::MAX_UTC);
    let mut stats = WaitStats {
        started_at,
        deadline,
        polls: 0,
    };
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return Ok((WaitOutcome::Cancelled(last), stats));
        }

        let now = clock.now();
        if now >= deadline {
            return Ok((WaitOutcome::TimedOut(last), stats));
        }

        stats.polls += 1;
        match probe()? {
            Probe::Ready(value) => return Ok((WaitOutcome::Ready(value), stats)),
            Probe::Pending(value) => last = Some(value),
        }

        let remaining = (deadline - clock.now()).to_std().unwrap_or(Duration::ZERO);
        clock.sleep(interval.min(remaining));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::convert::Infallible;

    #[test]
    fn test_default_config_valid() {
        let config = TimeoutConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(1800));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_bounds() {
        let zero = TimeoutConfig {
            timeout_minutes: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(TimeoutValidationError::TimeoutOutOfBounds { value: 0 })
        ));

        let fast = TimeoutConfig {
            poll_interval_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            fast.validate(),
            Err(TimeoutValidationError::IntervalOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_ready_after_three_polls() {
        let clock = FakeClock::at_epoch_seconds(1_000);
        let cancel = CancelToken::new();
        let mut calls = 0;

        let (outcome, stats) = poll_until(
            &clock,
            &cancel,
            Duration::from_secs(10),
            Duration::from_secs(60),
            || -> Result<Probe<u32>, Infallible> {
                calls += 1;
                Ok(if calls == 3 {
                    Probe::Ready(calls)
                } else {
                    Probe::Pending(calls)
                })
            },
        )
        .unwrap();

        assert_eq!(outcome, WaitOutcome::Ready(3));
        assert_eq!(stats.polls, 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10); 2]);
    }

    #[test]
    fn test_times_out_with_last_observation() {
        let clock = FakeClock::at_epoch_seconds(1_000);
        let cancel = CancelToken::new();

        let (outcome, stats) = poll_until(
            &clock,
            &cancel,
            Duration::from_secs(10),
            Duration::from_secs(25),
            || -> Result<Probe<&str>, Infallible> { Ok(Probe::Pending("still running")) },
        )
        .unwrap();

        assert_eq!(outcome, WaitOutcome::TimedOut(Some("still running")));
        // Polls at t=0, 10, 20; the last sleep is cut to 5s to land on the deadline.
        assert_eq!(stats.polls, 3);
        assert_eq!(clock.total_slept(), Duration::from_secs(25));
    }

    #[test]
    fn test_zero_timeout_never_probes() {
        let clock = FakeClock::at_epoch_seconds(1_000);
        let cancel = CancelToken::new();

        let (outcome, stats) = poll_until(
            &clock,
            &cancel,
            Duration::from_secs(10),
            Duration::ZERO,
            || -> Result<Probe<()>, Infallible> { panic!("probe must not run") },
        )
        .unwrap();

        assert_eq!(outcome, WaitOutcome::TimedOut(None));
        assert_eq!(stats.polls, 0);
    }

    #[test]
    fn test_cancel_between_polls() {
        let clock = FakeClock::at_epoch_seconds(1_000);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut calls = 0;

        let (outcome, _) = poll_until(
            &clock,
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(600),
            || -> Result<Probe<u32>, Infallible> {
                calls += 1;
                if calls == 2 {
                    trigger.cancel();
                }
                Ok(Probe::Pending(calls))
            },
        )
        .unwrap();

        assert_eq!(outcome, WaitOutcome::Cancelled(Some(2)));
    }

    #[test]
    fn test_probe_error_propagates() {
        let clock = FakeClock::at_epoch_seconds(1_000);
        let cancel = CancelToken::new();

        let result = poll_until(
            &clock,
            &cancel,
            Duration::from_secs(1),
            Duration::from_secs(5),
            || -> Result<Probe<()>, String> { Err("service down".to_string()) },
        );

        assert_eq!(result.unwrap_err(), "service down");
    }
}
