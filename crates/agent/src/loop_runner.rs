//! The agent reasoning loop implementation.
//!
//! Each iteration asks the backend what to do next (THINK). A tool request
//! runs every call through the [`ToolExecutor`] (ACT) and feeds the results
//! back into the transcript (OBSERVE) before thinking again; a plain answer
//! ends the run (RESPOND). Unrecoverable failures end it with an ERROR step
//! and a cancelled token ends it with a STOPPED step.
//!
//! Steps are pushed to an unbounded channel as they happen so a driver can
//! forward them to clients in order.

use serde::Serialize;
use slowhands_core::error::GatewayError;
use slowhands_core::message::{Conversation, Message, Role};
use slowhands_core::provider::ProviderRequest;
use slowhands_core::step::{AgentStep, Phase};
use slowhands_core::tool::{ToolCall, ToolRegistry};
use slowhands_config::AppConfig;
use slowhands_providers::{BackendGateway, GatewayStatus, resolve_model};
use slowhands_resilience::{BackoffPolicy, retry_with_notify};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tool_executor::{ToolExecutor, parse_tool_call};

const UNAVAILABLE: &str = "Service temporarily unavailable. Please try again later.";

/// Result of a synchronous run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub response: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<AgentStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub current_step: u32,
    pub max_iterations: u32,
    pub transcript_len: usize,
    pub tools: Vec<String>,
    pub gateway: GatewayStatus,
}

/// What one think/act iteration produced. Transcript changes are carried
/// here and committed only once the iteration completes in time.
enum Iteration {
    Respond { message: Message },
    Acted { messages: Vec<Message>, step: AgentStep },
    Failed(AgentStep),
}

/// Clears the loop's running flag when a run ends, including when the run
/// future is dropped before reaching a terminal step.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The core agent loop that orchestrates backend calls and tool execution.
pub struct AgentLoop {
    gateway: Arc<BackendGateway>,

    tools: Arc<ToolRegistry>,

    executor: ToolExecutor,

    model: String,

    temperature: f32,

    /// Default max tokens per backend response
    max_tokens: Option<u32>,

    system_prompt: String,

    /// Think/act iterations allowed per run
    max_iterations: u32,

    /// Wall-clock bound on a single iteration
    step_timeout: Duration,

    /// How often a timed-out iteration is attempted, and the wait between
    step_retry: BackoffPolicy,

    running: AtomicBool,
    current_step: AtomicU32,
}

impl AgentLoop {
    pub fn new(
        gateway: Arc<BackendGateway>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            gateway,
            tools,
            executor: ToolExecutor::new(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: String::new(),
            max_iterations: 10,
            step_timeout: Duration::from_secs(60),
            step_retry: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4), 3),
            running: AtomicBool::new(false),
            current_step: AtomicU32::new(0),
        }
    }

    /// Build a loop with every knob taken from configuration.
    pub fn from_config(
        gateway: Arc<BackendGateway>,
        tools: Arc<ToolRegistry>,
        config: &AppConfig,
    ) -> Self {
        Self::new(gateway, resolve_model(config), tools)
            .with_executor(ToolExecutor::from_config(&config.reliability))
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_system_prompt(&config.agent.system_prompt)
            .with_max_iterations(config.agent.max_iterations)
            .with_step_timeout(config.agent.step_timeout())
    }

    pub fn with_executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_step_retry(mut self, policy: BackoffPolicy) -> Self {
        self.step_retry = policy;
        self
    }

    pub fn gateway(&self) -> &Arc<BackendGateway> {
        &self.gateway
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_step(&self) -> u32 {
        self.current_step.load(Ordering::SeqCst)
    }

    /// Drive one run to a terminal step and return it.
    ///
    /// `conversation` must already end with the user's message. Every step,
    /// the terminal one included, is also sent on `steps`. The token is only
    /// checked between iterations, so a tool that is already executing is
    /// allowed to finish.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        steps: &mpsc::UnboundedSender<AgentStep>,
        cancel: &CancellationToken,
    ) -> AgentStep {
        info!(
            conversation_id = %conversation.id,
            messages = conversation.len(),
            "Starting agent run"
        );

        let running = RunningFlag::raise(&self.running);
        self.current_step.store(0, Ordering::SeqCst);
        self.ensure_system_prompt(conversation);

        let run_start = conversation.len();
        let mut step_number = 0;

        let terminal = loop {
            if cancel.is_cancelled() {
                info!(step = step_number, "Stop requested, ending run");
                break AgentStep::new(
                    step_number,
                    Phase::Stopped,
                    "Task interrupted by stop request.",
                );
            }

            if step_number >= self.max_iterations {
                warn!(iterations = step_number, "Max iterations reached without a final answer");
                break AgentStep::new(
                    step_number,
                    Phase::Respond,
                    self.partial_response(&conversation.messages[run_start..]),
                );
            }

            step_number += 1;
            self.current_step.store(step_number, Ordering::SeqCst);
            debug!(conversation_id = %conversation.id, step = step_number, "Agent loop iteration");

            let iteration = self.iterate_in_time(conversation, step_number, steps).await;

            match iteration {
                Err(attempts) => {
                    warn!(
                        step = step_number,
                        attempts,
                        timeout_secs = self.step_timeout.as_secs(),
                        "Agent step timed out on every attempt"
                    );
                    break AgentStep::new(
                        step_number,
                        Phase::Error,
                        format!(
                            "Agent step timed out after {}s. I tried {attempts} time(s) but the \
                             operation took too long to complete.",
                            self.step_timeout.as_secs()
                        ),
                    );
                }
                Ok(Iteration::Failed(step)) => break step,
                Ok(Iteration::Respond { message }) => {
                    let content = message.content.clone();
                    conversation.push(message);
                    break AgentStep::new(step_number, Phase::Respond, content);
                }
                Ok(Iteration::Acted { messages, step }) => {
                    // OBSERVE: tool outcomes join the transcript for the next THINK.
                    conversation.extend(messages);
                    let _ = steps.send(step);
                }
            }
        };

        drop(running);
        info!(
            conversation_id = %conversation.id,
            phase = %terminal.phase,
            steps = terminal.step_number,
            "Agent run finished"
        );
        let _ = steps.send(terminal.clone());
        terminal
    }

    /// Run to completion, collecting every step.
    pub async fn process(&self, conversation: &mut Conversation) -> RunSummary {
        self.process_until(conversation, &CancellationToken::new()).await
    }

    /// Like [`process`](Self::process), stopping early once `cancel` fires.
    pub async fn process_until(
        &self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let terminal = self.run(conversation, &tx, cancel).await;
        drop(tx);

        let mut steps = Vec::new();
        while let Some(step) = rx.recv().await {
            steps.push(step);
        }

        let success = terminal.phase == Phase::Respond;
        RunSummary {
            response: terminal.content.clone(),
            success,
            error: (!success).then(|| terminal.content),
            steps,
        }
    }

    pub async fn status(&self, conversation: &Conversation) -> AgentStatus {
        AgentStatus {
            running: self.is_running(),
            current_step: self.current_step.load(Ordering::SeqCst),
            max_iterations: self.max_iterations,
            transcript_len: conversation.len(),
            tools: self.tools.names().into_iter().map(String::from).collect(),
            gateway: self.gateway.status().await,
        }
    }

    /// Forget the transcript and the step counter.
    pub fn reset(&self, conversation: &mut Conversation) {
        conversation.clear();
        self.current_step.store(0, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        debug!("Agent reset");
    }

    fn ensure_system_prompt(&self, conversation: &mut Conversation) {
        if self.system_prompt.is_empty() {
            return;
        }
        let prompt = Message::system(&self.system_prompt);
        if conversation.messages.first().is_some_and(|m| m.role == Role::System) {
            conversation.messages[0] = prompt;
        } else {
            conversation.messages.insert(0, prompt);
        }
    }

    fn partial_response(&self, produced: &[Message]) -> String {
        let note = format!(
            "Reached the maximum of {} iterations without a final answer.",
            self.max_iterations
        );
        let partial = produced
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str());
        match partial {
            Some(text) => format!("{text}\n\n{note}"),
            None => note,
        }
    }

    /// One iteration under the step timeout. A timed-out attempt is discarded
    /// and retried under `step_retry`; `Err` carries the attempts made.
    async fn iterate_in_time(
        &self,
        conversation: &Conversation,
        step_number: u32,
        steps: &mpsc::UnboundedSender<AgentStep>,
    ) -> Result<Iteration, u32> {
        let timeout = self.step_timeout;
        let max_attempts = self.step_retry.max_attempts.max(1);
        retry_with_notify(
            &self.step_retry,
            move |_| async move {
                tokio::time::timeout(timeout, self.iterate(conversation, step_number, steps)).await
            },
            |_| true,
            |attempt, _, wait| {
                warn!(
                    step = step_number,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "Step timed out, retrying"
                );
                let _ = steps.send(AgentStep::new(
                    step_number,
                    Phase::Think,
                    format!("Step timed out, retrying... (attempt {}/{max_attempts})", attempt + 1),
                ));
            },
        )
        .await
        .map_err(|e| e.attempts)
    }

    async fn iterate(
        &self,
        conversation: &Conversation,
        step_number: u32,
        steps: &mpsc::UnboundedSender<AgentStep>,
    ) -> Iteration {
        // ── THINK ──
        let _ = steps.send(AgentStep::new(step_number, Phase::Think, "Thinking..."));

        let mut request = ProviderRequest::new(self.model.clone(), conversation.messages.clone());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.tools = self.tools.definitions();

        let max_attempts = self.gateway.retry_policy().max_attempts;
        let response = self
            .gateway
            .call_observed(request, |attempt, _, _| {
                let _ = steps.send(AgentStep::new(
                    step_number,
                    Phase::Think,
                    format!(
                        "Encountered temporary issue, retrying... (attempt {}/{})",
                        attempt + 1,
                        max_attempts
                    ),
                ));
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e @ GatewayError::CircuitOpen { .. }) => {
                warn!(error = %e, "Backend unavailable");
                return Iteration::Failed(AgentStep::new(
                    step_number,
                    Phase::Error,
                    format!("{UNAVAILABLE} {e}"),
                ));
            }
            Err(GatewayError::Backend { attempts, source }) => {
                let content = if source.is_retryable() {
                    format!(
                        "{UNAVAILABLE} The language model did not respond after \
                         {attempts} attempt(s): {source}"
                    )
                } else {
                    format!(
                        "Error communicating with the language model after \
                         {attempts} attempt(s): {source}"
                    )
                };
                return Iteration::Failed(AgentStep::new(step_number, Phase::Error, content));
            }
        };

        let message = response.message;
        if message.tool_calls.is_empty() {
            if message.content.trim().is_empty() {
                return Iteration::Failed(AgentStep::new(
                    step_number,
                    Phase::Error,
                    format!(
                        "Internal error: the model returned neither content nor tool calls \
                         (finish reason: {}).",
                        response.finish_reason.as_deref().unwrap_or("unknown")
                    ),
                ));
            }
            // ── RESPOND ──
            return Iteration::Respond { message };
        }

        // ── ACT ──
        debug!(tool_count = message.tool_calls.len(), "Executing tool calls");
        let raw_calls = message.tool_calls.clone();
        let mut messages = vec![message];
        let mut lines = Vec::with_capacity(raw_calls.len());
        let mut last = None;

        for raw in &raw_calls {
            let (call, result) = match parse_tool_call(raw) {
                Ok(call) => {
                    let result = self.executor.execute(&self.tools, &call).await;
                    (call, result)
                }
                Err(result) => (
                    ToolCall {
                        id: raw.id.clone(),
                        name: raw.name.clone(),
                        arguments: serde_json::Value::String(raw.arguments.clone()),
                    },
                    result,
                ),
            };

            lines.push(if result.success {
                format!("Used tool: {}", call.name)
            } else {
                format!("Failed to use tool: {}", call.name)
            });
            messages.push(Message::tool_result(&call.id, result.to_transcript()));
            last = Some((call, result));
        }

        let mut step = AgentStep::new(step_number, Phase::Act, lines.join("\n"));
        if let Some((call, result)) = last {
            step = step.with_tool(call, result);
        }
        Iteration::Acted { messages, step }
    }
}
