//! The guarded path to the language-model backend.
//!
//! Every backend call goes through [`BackendGateway::call`], which runs the
//! same fixed protocol:
//!
//! 1. `circuit.check()`: fail fast with `CircuitOpen` while the circuit is open
//! 2. estimate the request cost and wait for rate-limit admission
//! 3. attempt the call under a per-attempt timeout, retrying transient
//!    failures with backoff
//! 4. record the outcome on both the breaker and the limiter
//!
//! The rate limiter and circuit breaker are owned here and shared by every
//! run that holds the same gateway.

use serde::Serialize;
use slowhands_config::ReliabilityConfig;
use slowhands_core::error::{GatewayError, ProviderError};
use slowhands_core::provider::{Provider, ProviderRequest, ProviderResponse};
use slowhands_resilience::{
    BackoffPolicy, CircuitBreaker, CircuitStatus, RateLimiter, RateLimiterUsage, retry_with_notify,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Observability snapshot of the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub provider: String,
    pub circuit: CircuitStatus,
    pub rate_limiter: RateLimiterUsage,
    pub total_tokens_used: u64,
}

pub struct BackendGateway {
    provider: Arc<dyn Provider>,
    rate_limiter: RateLimiter,
    circuit: CircuitBreaker,
    retry_policy: BackoffPolicy,
    request_timeout: Duration,
    total_tokens: AtomicU64,
}

impl BackendGateway {
    /// A gateway with default limits: 60 RPM, 90k TPM, 5-failure breaker with
    /// a 60s reset, 3 attempts backing off 1s..60s, 60s per attempt.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            rate_limiter: RateLimiter::default(),
            circuit: CircuitBreaker::default(),
            retry_policy: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(60),
            total_tokens: AtomicU64::new(0),
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, config: &ReliabilityConfig) -> Self {
        Self::new(provider)
            .with_rate_limiter(RateLimiter::new(config.rate_limit_rpm, config.rate_limit_tpm))
            .with_circuit_breaker(CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout(),
            ))
            .with_retry_policy(BackoffPolicy::from_secs_f64(
                config.retry_min_wait_secs,
                config.retry_max_wait_secs,
                config.retry_attempts,
            ))
            .with_request_timeout(config.request_timeout())
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_retry_policy(mut self, policy: BackoffPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn retry_policy(&self) -> &BackoffPolicy {
        &self.retry_policy
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, GatewayError> {
        self.call_observed(request, |_, _, _| {}).await
    }

    /// Like [`call`](Self::call), reporting each retry as
    /// `on_retry(failed_attempt, &error, wait)` before the backoff sleep.
    pub async fn call_observed<N>(
        &self,
        request: ProviderRequest,
        mut on_retry: N,
    ) -> Result<ProviderResponse, GatewayError>
    where
        N: FnMut(u32, &ProviderError, Duration),
    {
        self.circuit.check()?;

        let estimated = request.estimated_tokens();
        self.rate_limiter.check_and_wait(estimated).await;

        let provider = self.provider.as_ref();
        let timeout = self.request_timeout;
        let max_attempts = self.retry_policy.max_attempts;
        let request = &request;

        let outcome = retry_with_notify(
            &self.retry_policy,
            |attempt| async move {
                debug!(
                    provider = %provider.name(),
                    attempt,
                    estimated_tokens = estimated,
                    "Calling backend"
                );
                match tokio::time::timeout(timeout, provider.complete(request.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(format!(
                        "no response within {}s",
                        timeout.as_secs()
                    ))),
                }
            },
            |e| provider.is_retryable(e),
            |attempt, e, wait| {
                warn!(
                    provider = %provider.name(),
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Transient backend failure, retrying"
                );
                on_retry(attempt, e, wait);
            },
        )
        .await;

        match outcome {
            Ok(response) => {
                let tokens = response.usage.as_ref().map_or(0, |u| u.total_tokens);
                self.circuit.record_success();
                self.rate_limiter.record_request(tokens).await;
                self.total_tokens.fetch_add(u64::from(tokens), Ordering::Relaxed);
                Ok(response)
            }
            Err(failure) => {
                // Only outages count toward opening the circuit.
                if provider.is_retryable(&failure.error) {
                    self.circuit.record_failure();
                }
                self.rate_limiter.record_request(0).await;
                error!(
                    provider = %provider.name(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Backend call failed"
                );
                Err(GatewayError::Backend {
                    attempts: failure.attempts,
                    source: failure.error,
                })
            }
        }
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            provider: self.provider.name().to_string(),
            circuit: self.circuit.status(),
            rate_limiter: self.rate_limiter.get_current_usage().await,
            total_tokens_used: self.total_tokens.load(Ordering::Relaxed),
        }
    }

    /// Administrative circuit reset.
    pub fn reset_circuit(&self) {
        self.circuit.reset();
    }
}
