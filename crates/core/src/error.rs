//! Error types for the SlowHands domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; failures are values the
//! caller matches on, never control flow hidden behind unwinding.

use std::time::Duration;
use thiserror::Error;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Transient failures: rate limiting, timeouts, connection errors, and
    /// server-side (5xx) responses. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500 || *status_code == 408,
            Self::AuthenticationFailed(_)
            | Self::ModelNotFound(_)
            | Self::NotConfigured(_) => false,
        }
    }
}

/// Failure of a call routed through the backend gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The circuit breaker rejected the call before it was attempted.
    #[error(
        "Circuit breaker is open after {failure_count} failures. Retry after {}s",
        .retry_after.as_secs()
    )]
    CircuitOpen {
        failure_count: u32,
        retry_after: Duration,
    },

    /// The backend failed and local retries (if any applied) were exhausted.
    #[error("Backend call failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

impl GatewayError {
    /// Number of backend attempts made before giving up (0 when the circuit
    /// rejected the call outright).
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { .. } => 0,
            Self::Backend { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    /// Validation, authorization, and lookup failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed { .. } | Self::Timeout { .. })
    }
}

/// Failure to push an event down a live connection.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Connection {0} is closed")]
    Closed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}
