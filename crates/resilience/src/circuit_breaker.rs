//! Three-state circuit breaker guarding the language-model backend.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(reset timeout elapsed)--> HALF_OPEN
//!   ^                                                                     |
//!   +------------------------(success)------------------------------------+
//! ```
//!
//! The OPEN -> HALF_OPEN transition is lazy: it happens when the state is
//! next read, not on a timer. A failure during a HALF_OPEN probe reopens the
//! circuit straight away because the failure count is only cleared by a
//! recorded success.

use serde::Serialize;
use slowhands_core::GatewayError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Probing: calls are let through to test recovery.
    HalfOpen,
}

/// Observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply the lazy OPEN -> HALF_OPEN transition and return the result.
    fn current(&self, inner: &mut Inner) -> CircuitState {
        if inner.state == CircuitState::Open
            && inner
                .last_failure
                .is_some_and(|t| t.elapsed() >= self.reset_timeout)
        {
            inner.state = CircuitState::HalfOpen;
            info!(
                failure_count = inner.failure_count,
                "Circuit breaker half-open: probing backend"
            );
        }
        inner.state
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.current(&mut inner)
    }

    /// Admit a call, or reject it with [`GatewayError::CircuitOpen`] while the
    /// circuit is open. HALF_OPEN lets the call through.
    pub fn check(&self) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        if self.current(&mut inner) != CircuitState::Open {
            return Ok(());
        }
        let retry_after = inner
            .last_failure
            .map(|t| self.reset_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.reset_timeout);
        Err(GatewayError::CircuitOpen {
            failure_count: inner.failure_count,
            retry_after,
        })
    }

    /// Full recovery from any state.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed: backend recovered");
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    failure_count = inner.failure_count,
                    threshold = self.failure_threshold,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Administrative reset to CLOSED with a clean count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        info!("Circuit breaker manually reset");
    }

    pub fn status(&self) -> CircuitStatus {
        let mut inner = self.lock();
        CircuitStatus {
            state: self.current(&mut inner),
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            reset_timeout_secs: self.reset_timeout.as_secs(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
