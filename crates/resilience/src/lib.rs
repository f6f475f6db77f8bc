//! # SlowHands Resilience
//!
//! The guards placed around every outbound backend call and tool execution:
//!
//! - [`RateLimiter`]: RPM/TPM admission over a trailing 60 second window.
//! - [`CircuitBreaker`]: CLOSED/OPEN/HALF_OPEN failure detector with a lazy
//!   recovery transition (no background timer).
//! - [`BackoffPolicy`]: exponential backoff with jitter.
//! - [`retry`]: the higher-order retry function that ties a policy and a
//!   retriability predicate to an operation.
//!
//! All waiting goes through `tokio::time`, so tests drive these with paused
//! time instead of real sleeps.

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use backoff::{BackoffPolicy, compute_wait};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use rate_limiter::{RateLimiter, RateLimiterUsage};
pub use retry::{RetryError, retry, retry_with_notify};
