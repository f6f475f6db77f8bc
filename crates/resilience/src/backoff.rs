//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Fraction of the base wait used as the upper bound for jitter.
const JITTER_RATIO: f64 = 0.2;

/// Wait before retry `attempt` (0-based): `min(base * 2^attempt, cap)`, plus
/// jitter drawn uniformly from `[0, 0.2 * wait)`.
pub fn compute_wait(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let wait = base_wait(attempt, base, cap);
    wait + wait.mul_f64(rand::rng().random_range(0.0..JITTER_RATIO))
}

fn base_wait(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(cap)
}

/// Retry cadence for one call site. Backend calls and tool executions each
/// carry their own policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build from the `(min_wait, max_wait)` second pair used in config files.
    pub fn from_secs_f64(min_wait: f64, max_wait: f64, max_attempts: u32) -> Self {
        Self::new(
            Duration::from_secs_f64(min_wait.max(0.0)),
            Duration::from_secs_f64(max_wait.max(0.0)),
            max_attempts,
        )
    }

    /// The deterministic part of the wait, without jitter.
    pub fn base_wait(&self, attempt: u32) -> Duration {
        base_wait(attempt, self.base, self.cap)
    }

    pub fn compute_wait(&self, attempt: u32) -> Duration {
        compute_wait(attempt, self.base, self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 3)
    }
}
