//! End-to-end tests for the SlowHands runtime.
//!
//! These drive the full pipeline: scripted backend, backend gateway, agent
//! loop with a real tool, run driver, delivery layer, and HTTP router.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use slowhands_agent::AgentLoop;
use slowhands_config::AppConfig;
use slowhands_core::error::{DeliveryError, ProviderError, ToolError};
use slowhands_core::message::{Message, MessageToolCall};
use slowhands_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use slowhands_core::tool::{Tool, ToolRegistry, ToolResult};
use slowhands_gateway::{ConnectionSink, GatewayState, SharedState, build_router};
use slowhands_providers::BackendGateway;
use slowhands_resilience::{BackoffPolicy, CircuitBreaker};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ── Mocks ────────────────────────────────────────────────────────────────

/// Plays back scripted outcomes in order; fails once exhausted.
struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
}

impl ScriptedProvider {
    fn new(outcomes: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
        model: "mock-model".into(),
    }
}

fn tool_response(name: &str, arguments: Value) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tools(
            "",
            vec![MessageToolCall {
                id: "call_1".into(),
                name: name.into(),
                arguments: arguments.to_string(),
            }],
        ),
        usage: None,
        finish_reason: Some("tool_calls".into()),
        model: "mock-model".into(),
    }
}

struct WordCountTool;

#[async_trait]
impl Tool for WordCountTool {
    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count the words in a piece of text"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("text must be a string".into()))?;
        Ok(ToolResult::ok(text.split_whitespace().count().to_string()))
    }
}

#[derive(Default)]
struct MemorySink(Mutex<Vec<Value>>);

impl MemorySink {
    fn types(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl ConnectionSink for MemorySink {
    async fn send(&self, event: &Value) -> Result<(), DeliveryError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn state_with(
    provider: ScriptedProvider,
    gateway: impl FnOnce(BackendGateway) -> BackendGateway,
) -> SharedState {
    let dir = std::env::temp_dir();
    let config = AppConfig {
        workspace_path: dir,
        ..AppConfig::default()
    };
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(WordCountTool));
    let gateway = Arc::new(gateway(BackendGateway::new(Arc::new(provider))));
    let agent = AgentLoop::new(gateway, "mock-model", Arc::new(tools));
    Arc::new(GatewayState::new(&config, Some(agent), CancellationToken::new()))
}

fn word_count_script() -> ScriptedProvider {
    ScriptedProvider::new(vec![
        Ok(tool_response("word_count", json!({"text": "one two three"}))),
        Ok(text_response("The text has 3 words.")),
    ])
}

async fn post(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_runs_tool_then_answers() {
    let state = state_with(word_count_script(), |g| g);
    let app = build_router(state.clone());

    let (status, body) = post(&app, "/agent/chat", json!({"message": "How many words?"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["response"], "The text has 3 words.");

    let phases: Vec<&str> = body["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["phase"].as_str().unwrap())
        .collect();
    assert_eq!(phases, ["think", "act", "think", "respond"]);
    assert_eq!(body["steps"][1]["tool_result"]["output"], "3");

    let transcript = state.service.transcript();
    assert!(transcript.messages.iter().any(|m| m.content == "The text has 3 words."));
}

#[tokio::test]
async fn events_survive_a_disconnected_client() {
    let state = state_with(word_count_script(), |g| g);
    state.sessions.get_or_create_session("s1");

    // Nobody is connected: every event is queued and logged to the session.
    let terminal = state
        .service
        .run_stream("How many words?".into(), Some("req_e2e".into()), Some("s1".into()))
        .await
        .unwrap();
    assert_eq!(terminal.content, "The text has 3 words.");
    assert_eq!(state.connections.queue().len(), 5);

    // The client arrives and receives the backlog in order.
    let sink = Arc::new(MemorySink::default());
    state.connections.connect("c1", sink.clone()).await;
    assert_eq!(sink.types(), ["step", "step", "step", "step", "complete"]);
    assert!(state.connections.queue().is_empty());

    let events = sink.0.lock().unwrap().clone();
    assert_eq!(events[1]["tool_name"], "word_count");
    assert_eq!(events[1]["tool_success"], true);
    assert!(events.iter().all(|e| e["correlation_id"] == "req_e2e"));

    // A later resume can replay the same run from the session log.
    let replay = state.sessions.get_pending_messages("s1", None);
    assert_eq!(replay, events);
    assert!(!state.sessions.get_or_create_session("s1").0.agent_running);
}

#[tokio::test]
async fn circuit_opens_and_is_reset_over_http() {
    let failures = (0..3)
        .map(|_| {
            Err(ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into(),
            })
        })
        .collect();
    let state = state_with(ScriptedProvider::new(failures), |g| {
        g.with_retry_policy(BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 1))
            .with_circuit_breaker(CircuitBreaker::new(2, Duration::from_secs(60)))
    });
    let app = build_router(state);

    for _ in 0..2 {
        let (status, body) = post(&app, "/agent/chat", json!({"message": "hi"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    let (_, body) = post(&app, "/agent/chat", json!({"message": "hi"})).await;
    assert!(body["error"].as_str().unwrap().contains("Circuit breaker is open"));

    let (status, body) = post(&app, "/agent/circuit/reset", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["circuit"]["state"], "closed");
    assert_eq!(body["circuit"]["failure_count"], 0);
}

#[tokio::test]
async fn state_snapshot_written_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent_state.json");
    let state = state_with(word_count_script(), |g| g);
    state.sessions.get_or_create_session("s1");

    state.service.chat("How many words?").await.unwrap();
    state.service.save_state(&path).await.unwrap();

    let snapshot = slowhands_gateway::load_state(&path).await.unwrap().unwrap();
    assert_eq!(snapshot.version, "1.0");
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.transcript.last().unwrap().content, "The text has 3 words.");
}
