//! Capped multiplicative backoff used by the reconnect loops.
//!
//! After `k` consecutive failed attempts the next wait is
//! `min(min_interval * multiplier^k, max_interval)`. A successful connect
//! resets the failure count, so the next drop waits `min_interval` again.

use std::time::Duration;

use thiserror::Error;

/// First invalid parameter found by [`BackoffPolicy::validate`].
#[derive(Clone, Debug, PartialEq, Error)]
pub enum BackoffError {
    #[error("backoff minimum interval must be positive")]
    ZeroMinimum,
    #[error("backoff maximum interval {max:?} is below the minimum {min:?}")]
    MaxBelowMin { min: Duration, max: Duration },
    #[error("backoff multiplier must be >= 1.0, got {0}")]
    Multiplier(f64),
}

/// Tunable parameters for the reconnect backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Wait before the first reconnect attempt after a drop.
    pub min_interval: Duration,
    /// Upper bound on the wait between attempts.
    pub max_interval: Duration,
    /// Factor applied to the wait after each failed attempt.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
        }
    }
}

impl BackoffPolicy {
    /// Wait interval after `failures` consecutive failed attempts.
    pub fn interval_after(&self, failures: u32) -> Duration {
        let base = self.min_interval.as_secs_f64();
        let cap = self.max_interval.as_secs_f64().max(base);
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let scaled = base * self.multiplier.powi(exponent);
        // powi can overflow to inf; clamp before converting back.
        let secs = if scaled.is_finite() { scaled.clamp(0.0, cap) } else { cap };
        Duration::from_secs_f64(secs)
    }

    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.min_interval.is_zero() {
            return Err(BackoffError::ZeroMinimum);
        }
        if self.max_interval < self.min_interval {
            return Err(BackoffError::MaxBelowMin {
                min: self.min_interval,
                max: self.max_interval,
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BackoffError::Multiplier(self.multiplier));
        }
        Ok(())
    }
}

/// Running failure counter bound to a [`BackoffPolicy`].
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Number of consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Interval to wait before the next attempt given the current failure count.
    pub fn current(&self) -> Duration {
        self.policy.interval_after(self.failures)
    }

    /// Record a failed attempt and return the interval to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current()
    }

    /// Record a successful attempt; the interval drops back to the minimum.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
