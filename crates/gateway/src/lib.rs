//! Delivery layer for SlowHands.
//!
//! Streams agent progress to clients over WebSocket, buffers events while no
//! client is attached, replays them on reconnect, and exposes the HTTP
//! operational surface (health, chat, stop/reset, workspace files).
//!
//! Built on Axum.

pub mod connection;
pub mod files;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod ws;

use axum::{
    Router,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use slowhands_agent::{AgentLoop, AgentStatus};
use slowhands_config::AppConfig;
use slowhands_core::error::ProviderError;
use slowhands_core::step::AgentStep;
use slowhands_core::tool::ToolRegistry;
use slowhands_providers::{BackendGateway, GatewayStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use connection::{ConnectionManager, ConnectionSink, ConnectionStats};
pub use protocol::{ClientMessage, ServerEvent};
pub use queue::{MessageQueue, QueueStats};
pub use service::{AgentService, ServiceError};
pub use session::{SessionRegistry, SessionState};
pub use snapshot::{StateSnapshot, load_state, save_state};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub service: Arc<AgentService>,
    pub connections: Arc<ConnectionManager>,
    pub sessions: Arc<SessionRegistry>,
    pub workspace: PathBuf,
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Wire the delivery layer around an agent. `None` serves the
    /// operational surface with the agent reported as not ready.
    pub fn new(config: &AppConfig, agent: Option<AgentLoop>, shutdown: CancellationToken) -> Self {
        let connections = Arc::new(ConnectionManager::from_config(&config.gateway));
        let sessions = Arc::new(SessionRegistry::new(config.gateway.session_log_capacity));
        let service = Arc::new(
            AgentService::new(agent, connections.clone(), sessions.clone())
                .with_shutdown(shutdown.clone()),
        );
        Self {
            service,
            connections,
            sessions,
            workspace: config.workspace_path.clone(),
            shutdown,
        }
    }
}

/// Build the agent described by the configuration, backed by the configured
/// provider.
pub fn build_agent(
    config: &AppConfig,
    tools: Arc<ToolRegistry>,
) -> Result<AgentLoop, ProviderError> {
    let provider = slowhands_providers::build_from_config(config)?;
    let gateway = Arc::new(BackendGateway::from_config(provider, &config.reliability));
    Ok(AgentLoop::from_config(gateway, tools, config))
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent/chat", post(chat_handler))
        .route("/agent/stream", post(stream_handler))
        .route("/agent/stop", post(stop_handler))
        .route("/agent/reset", post(reset_handler))
        .route("/agent/circuit/reset", post(circuit_reset_handler))
        .route("/api/files", get(list_files_handler))
        .route("/api/files/{*path}", get(read_file_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server and serve until `state.shutdown` fires.
///
/// The stale-connection sweep runs alongside and stops with the server. On
/// the way out the agent and session state is written to the configured
/// state file.
pub async fn start(
    config: &AppConfig,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let maintenance = state.connections.clone().spawn_maintenance(state.shutdown.clone());
    let session_gc = spawn_session_gc(
        state.sessions.clone(),
        config.gateway.stale_sweep_interval(),
        config.gateway.connection_timeout(),
        state.shutdown.clone(),
    );
    let shutdown = state.shutdown.clone();
    let service = state.service.clone();
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(maintenance, session_gc);
    if let Err(e) = service.save_state(&config.gateway.state_file).await {
        warn!(error = %e, "Failed to save state");
    }
    info!("Gateway stopped");
    Ok(())
}

/// Periodically drop sessions nobody has resumed within `max_idle`.
fn spawn_session_gc(
    sessions: Arc<SessionRegistry>,
    every: std::time::Duration,
    max_idle: std::time::Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let removed = sessions.remove_idle_sessions(max_idle);
                    if removed > 0 {
                        info!(removed, remaining = sessions.len(), "Idle sessions removed");
                    }
                }
            }
        }
    })
}

// --- Handlers ---

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { detail: detail.into() }))
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match err {
            ServiceError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Busy(_) => StatusCode::CONFLICT,
        };
        api_error(status, err.to_string())
    }
}

#[derive(Serialize)]
struct ConnectionsHealth {
    count: usize,
    details: Vec<ConnectionStats>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    agent_ready: bool,
    agent: Option<AgentStatus>,
    connections: ConnectionsHealth,
    message_queue: QueueStats,
    sessions: usize,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let details = state.connections.connection_stats().await;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        agent_ready: state.service.is_ready(),
        agent: state.service.status().await,
        connections: ConnectionsHealth {
            count: details.len(),
            details,
        },
        message_queue: state.connections.queue_stats(),
        sessions: state.sessions.len(),
    })
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    steps: Vec<AgentStep>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn chat_handler(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    info!(message_len = req.message.len(), "Chat request");
    let summary = state.service.chat(&req.message).await?;
    Ok(Json(ChatResponse {
        response: summary.response,
        steps: summary.steps,
        success: summary.success,
        error: summary.error,
    }))
}

#[derive(Deserialize)]
struct StreamRequest {
    message: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct StreamResponse {
    status: &'static str,
    message: &'static str,
    correlation_id: String,
}

async fn stream_handler(
    State(state): State<SharedState>,
    Json(req): Json<StreamRequest>,
) -> Result<Json<StreamResponse>, ApiError> {
    if let Some(sid) = &req.session_id {
        state.sessions.get_or_create_session(sid);
    }
    let correlation_id = state
        .service
        .start_stream(req.message, req.correlation_id, req.session_id)?;
    Ok(Json(StreamResponse {
        status: "streaming",
        message: "Check WebSocket for updates",
        correlation_id,
    }))
}

#[derive(Serialize)]
struct ActionResponse {
    status: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

async fn stop_handler(State(state): State<SharedState>) -> Result<Json<ActionResponse>, ApiError> {
    let cid = state.service.stop(None).await?;
    Ok(Json(ActionResponse {
        status: "stopped",
        message: "Agent stopped",
        correlation_id: Some(cid),
    }))
}

async fn reset_handler(State(state): State<SharedState>) -> Result<Json<ActionResponse>, ApiError> {
    state.service.reset()?;
    Ok(Json(ActionResponse {
        status: "reset",
        message: "Agent conversation cleared",
        correlation_id: None,
    }))
}

async fn circuit_reset_handler(
    State(state): State<SharedState>,
) -> Result<Json<GatewayStatus>, ApiError> {
    let status = state.service.reset_circuit().await?;
    warn!(provider = %status.provider, "Circuit breaker manually reset");
    Ok(Json(status))
}

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<files::FileNode>,
    workspace: String,
}

async fn list_files_handler(
    State(state): State<SharedState>,
) -> Result<Json<FileListResponse>, ApiError> {
    let workspace = state.workspace.clone();
    let root = workspace.display().to_string();
    let files = tokio::task::spawn_blocking(move || files::list_tree(&workspace))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error listing workspace: {e}"),
            )
        })?;
    Ok(Json(FileListResponse { files, workspace: root }))
}

async fn read_file_handler(
    State(state): State<SharedState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Json<files::FileContent>, ApiError> {
    let workspace = state.workspace.clone();
    let read = tokio::task::spawn_blocking(move || files::read_file(&workspace, &path))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    read.map(Json).map_err(|e| {
        let status = match e {
            files::FileError::AccessDenied => StatusCode::FORBIDDEN,
            files::FileError::NotFound(_) => StatusCode::NOT_FOUND,
            files::FileError::NotAFile(_) => StatusCode::BAD_REQUEST,
            files::FileError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, e.to_string())
    })
}
