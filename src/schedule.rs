//! Time-driven release of work.
//!
//! Both the dispatch retry path and the load harness release work on a clock:
//! the engine delays a requeued job by a capped exponential [`Backoff`], and
//! the harness releases synthetic calls to follow a [`RampSchedule`].

use std::time::Duration;

use crate::config::RetryPolicy;

/// Capped exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial_ms = (initial.as_millis() as u64).max(1);
        Self {
            initial_ms,
            max_ms: (max.as_millis() as u64).max(initial_ms),
        }
    }

    /// Delay before the retry that follows `exponent` earlier retries.
    ///
    /// `delay(0)` is the initial backoff; every step doubles until `max`.
    pub fn delay(&self, exponent: u32) -> Duration {
        let factor = 2u64.saturating_pow(exponent);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

impl From<&RetryPolicy> for Backoff {
    fn from(policy: &RetryPolicy) -> Self {
        Self::new(
            Duration::from_millis(policy.initial_backoff_ms),
            Duration::from_millis(policy.max_backoff_ms),
        )
    }
}

/// Linear ramp from zero to `target` cumulative arrivals over `ramp_up`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampSchedule {
    target: u64,
    ramp_up: Duration,
}

impl RampSchedule {
    pub fn new(target: u64, ramp_up: Duration) -> Self {
        Self { target, ramp_up }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Number of arrivals that should have been released by `elapsed`.
    pub fn cumulative_at(&self, elapsed: Duration) -> u64 {
        if self.ramp_up.is_zero() || elapsed >= self.ramp_up {
            return self.target;
        }
        let fraction = elapsed.as_secs_f64() / self.ramp_up.as_secs_f64();
        ((self.target as f64 * fraction).floor() as u64).min(self.target)
    }

    /// Earliest elapsed time at which `cumulative_at` reaches `count`.
    pub fn release_time(&self, count: u64) -> Duration {
        if self.target == 0 || count == 0 || self.ramp_up.is_zero() {
            return Duration::ZERO;
        }
        let count = count.min(self.target);
        self.ramp_up.mul_f64(count as f64 / self.target as f64)
    }
}
