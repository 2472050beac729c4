//! Retry Policies and Tracking
//!
//! Bounded or unbounded retry with exponential backoff, used for device
//! reconnects and for slaves waiting on a master that is not ready yet.

use fleetmount_core::NodeConfig;
use std::time::Duration;

/// Policy for retrying a failed operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (None = retry forever)
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub backoff: Duration,
    /// Multiplier applied to the delay after every retry
    pub factor: f64,
    /// Upper bound for the delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff: Duration::from_millis(100),
            factor: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom values
    pub fn new(max_retries: Option<u32>, backoff: Duration, factor: f64, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            factor,
            max_backoff,
        }
    }

    /// Reconnect policy of a device, from its connection parameters.
    ///
    /// `max-connection-attempts` counts the first attempt, so the number of
    /// retries is one less; zero means unlimited.
    pub fn reconnect(config: &NodeConfig) -> Self {
        let max_retries = match config.max_connection_attempts {
            0 => None,
            attempts => Some(attempts - 1),
        };
        Self {
            max_retries,
            backoff: Duration::from_millis(config.between_attempts_timeout_millis),
            factor: config.sleep_factor.max(1.0),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Tracks retries of one operation
#[derive(Debug)]
pub struct RetryTracker {
    policy: RetryPolicy,
    retries: u32,
}

impl RetryTracker {
    /// Create a new retry tracker with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Record a failure and decide whether to retry.
    ///
    /// Returns `Some(backoff)` if another attempt is allowed,
    /// or `None` once the retry limit has been reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let backoff = self.calculate_backoff();
        self.retries += 1;
        Some(backoff)
    }

    fn calculate_backoff(&self) -> Duration {
        let exponent = i32::try_from(self.retries).unwrap_or(i32::MAX);
        let scaled = self.policy.backoff.as_secs_f64() * self.policy.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.policy.max_backoff.as_secs_f64() {
            return self.policy.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Number of retries granted so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy.max_retries.is_some_and(|max| self.retries >= max)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
