//! Retrying tool execution.
//!
//! Each requested tool call runs under its own retry loop: a raised
//! [`ToolError`] that is transient, or a result with `success == false`,
//! counts as a retriable failure. Once attempts run out the caller gets a
//! failed [`ToolResult`] that names the tool, the last error and the original
//! arguments, so the model can correct itself on the next turn.

use slowhands_config::ReliabilityConfig;
use slowhands_core::error::ToolError;
use slowhands_core::message::MessageToolCall;
use slowhands_core::tool::{ToolCall, ToolRegistry, ToolResult};
use slowhands_resilience::{BackoffPolicy, retry_with_notify};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a single attempt did not produce a usable result.
#[derive(Debug)]
enum AttemptFailure {
    Raised(ToolError),
    Unsuccessful(ToolResult),
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Raised(e) => e.is_retryable(),
            Self::Unsuccessful(_) => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Raised(e) => e.to_string(),
            Self::Unsuccessful(r) => r
                .error
                .clone()
                .unwrap_or_else(|| "Tool execution failed".into()),
        }
    }
}

pub struct ToolExecutor {
    policy: BackoffPolicy,
    timeout: Duration,
}

impl ToolExecutor {
    /// Defaults: 3 attempts backing off 1s..10s, 120s per attempt.
    pub fn new() -> Self {
        Self {
            policy: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 3),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> Self {
        Self {
            policy: BackoffPolicy::from_secs_f64(
                config.tool_retry_min_wait_secs,
                config.tool_retry_max_wait_secs,
                config.tool_retry_attempts,
            ),
            timeout: config.tool_timeout(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run one call to completion. Never fails: every outcome, including an
    /// unknown tool, is reported as a [`ToolResult`].
    pub async fn execute(&self, tools: &ToolRegistry, call: &ToolCall) -> ToolResult {
        if !tools.contains(&call.name) {
            warn!(tool = %call.name, "Unknown tool requested");
            return ToolResult::fail(format!("Unknown tool: {}", call.name));
        }

        let max_attempts = self.policy.max_attempts;
        let timeout = self.timeout;

        let outcome = retry_with_notify(
            &self.policy,
            |attempt| async move {
                info!(tool = %call.name, attempt, max_attempts, "Executing tool");
                let result = match tokio::time::timeout(timeout, tools.execute(call)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        tool_name: call.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    }),
                };
                match result {
                    Ok(r) if r.success => Ok(r),
                    Ok(r) => Err(AttemptFailure::Unsuccessful(r)),
                    Err(e) => Err(AttemptFailure::Raised(e)),
                }
            },
            AttemptFailure::is_retryable,
            |attempt, failure, wait| {
                warn!(
                    tool = %call.name,
                    attempt,
                    error = %failure.describe(),
                    wait_ms = wait.as_millis() as u64,
                    "Tool attempt failed, retrying"
                );
            },
        )
        .await;

        match outcome {
            Ok(result) => {
                debug!(tool = %call.name, "Tool succeeded");
                result
            }
            Err(failure) => {
                let last_error = failure.error.describe();
                warn!(
                    tool = %call.name,
                    attempts = failure.attempts,
                    error = %last_error,
                    "Tool failed"
                );
                ToolResult::fail(format!(
                    "Tool '{}' failed after {} attempts. Last error: {}. Arguments: {}",
                    call.name, failure.attempts, last_error, call.arguments
                ))
                .with_metadata("attempts", serde_json::json!(failure.attempts))
                .with_metadata("arguments", call.arguments.clone())
            }
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a backend tool request into an executable call.
///
/// Malformed argument JSON fails immediately with a result describing the
/// problem; it is never retried.
pub fn parse_tool_call(raw: &MessageToolCall) -> Result<ToolCall, ToolResult> {
    let arguments = if raw.arguments.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&raw.arguments).map_err(|e| {
            ToolResult::fail(format!(
                "Invalid arguments for tool '{}': {e}. Arguments: {}",
                raw.name, raw.arguments
            ))
        })?
    };
    Ok(ToolCall {
        id: raw.id.clone(),
        name: raw.name.clone(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails `failures` times in the configured way, then succeeds.
    struct FlakyTool {
        failures: u32,
        soft: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl slowhands_core::Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Fails a few times"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.soft {
                    return Ok(ToolResult::fail("disk busy"));
                }
                return Err(ToolError::ExecutionFailed {
                    tool_name: "flaky".into(),
                    reason: "exit status 1".into(),
                });
            }
            Ok(ToolResult::ok("done"))
        }
    }

    struct DeniedTool;

    #[async_trait]
    impl slowhands_core::Tool for DeniedTool {
        fn name(&self) -> &str {
            "denied"
        }
        fn description(&self) -> &str {
            "Always refuses"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            Err(ToolError::PermissionDenied {
                tool_name: "denied".into(),
                reason: "outside workspace".into(),
            })
        }
    }

    struct HangingTool;

    #[async_trait]
    impl slowhands_core::Tool for HangingTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "Never returns"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            std::future::pending().await
        }
    }

    fn registry(failures: u32, soft: bool) -> (ToolRegistry, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(FlakyTool {
            failures,
            soft,
            calls: calls.clone(),
        }));
        tools.register(Box::new(DeniedTool));
        tools.register(Box::new(HangingTool));
        (tools, calls)
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: serde_json::json!({"path": "src/main.rs"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_raised_errors_until_success() {
        let (tools, calls) = registry(2, false);
        let result = ToolExecutor::new().execute(&tools, &call("flaky")).await;
        assert!(result.success);
        assert_eq!(result.output, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unsuccessful_results_are_retried() {
        let (tools, calls) = registry(1, true);
        let result = ToolExecutor::new().execute(&tools, &call("flaky")).await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_embeds_error_and_arguments() {
        let (tools, calls) = registry(10, true);
        let result = ToolExecutor::new().execute(&tools, &call("flaky")).await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let error = result.error.unwrap();
        assert!(error.starts_with("Tool 'flaky' failed after 3 attempts."));
        assert!(error.contains("Last error: disk busy"));
        assert!(error.contains("src/main.rs"));
        assert_eq!(result.metadata["attempts"], 3);
        assert_eq!(result.metadata["arguments"]["path"], "src/main.rs");
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_on_first_attempt() {
        let (tools, _) = registry(0, false);
        let result = ToolExecutor::new().execute(&tools, &call("denied")).await;
        assert!(!result.success);
        assert_eq!(result.metadata["attempts"], 1);
        assert!(result.error.unwrap().contains("Permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tool_is_not_retried() {
        let (tools, _) = registry(0, false);
        let result = ToolExecutor::new().execute(&tools, &call("teleport")).await;
        assert_eq!(result.error.as_deref(), Some("Unknown tool: teleport"));
        assert!(result.metadata.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_tool_times_out_each_attempt() {
        let (tools, _) = registry(0, false);
        let executor = ToolExecutor::new()
            .with_timeout(Duration::from_secs(2))
            .with_policy(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 2));
        let result = executor.execute(&tools, &call("hang")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(result.metadata["attempts"], 2);
    }

    #[test]
    fn malformed_arguments_fail_immediately() {
        let raw = MessageToolCall {
            id: "c".into(),
            name: "file_read".into(),
            arguments: "{not json".into(),
        };
        let failure = parse_tool_call(&raw).unwrap_err();
        assert!(failure.error.unwrap().contains("Invalid arguments for tool 'file_read'"));

        let empty = MessageToolCall {
            arguments: String::new(),
            ..raw
        };
        assert!(parse_tool_call(&empty).unwrap().arguments.is_object());
    }
}
