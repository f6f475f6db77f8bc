//! Run driver: turns agent steps into wire events.
//!
//! One run may be active at a time. A streamed run executes on its own task
//! and forwards each step to the [`ConnectionManager`] as it happens, and to
//! the requesting session's replay log when it has one. Every run gets a
//! child of the process shutdown token, so stopping the process stops it.

use slowhands_agent::{AgentLoop, AgentStatus, RunSummary};
use slowhands_core::message::{Conversation, Message};
use slowhands_core::step::AgentStep;
use slowhands_providers::GatewayStatus;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{ConnectionManager, short_id};
use crate::protocol::ServerEvent;
use crate::session::SessionRegistry;
use crate::snapshot::{self, AgentSnapshot, SnapshotError, StateSnapshot};

#[derive(Debug, Error, PartialEq)]
pub enum ServiceError {
    #[error("Agent not initialized. Check the backend configuration and restart the server.")]
    NotReady,

    #[error("Agent is busy with request {0}. Wait for it to finish or stop it first.")]
    Busy(String),
}

struct ActiveRun {
    correlation_id: String,
    cancel: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

/// Holds the single run slot for one run. Dropping it frees the slot and
/// clears the session's running flag, whether the run finished or its
/// future was dropped part way.
struct RunSlot {
    active: ActiveSlot,
    correlation_id: String,
    session: Option<(Arc<SessionRegistry>, String)>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if let Some((sessions, sid)) = &self.session {
            sessions.update_session_state(sid, Some(false), None);
        }
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|r| r.correlation_id == self.correlation_id) {
            *active = None;
        }
    }
}

pub struct AgentService {
    agent: Option<Arc<AgentLoop>>,
    /// Committed transcript; a run works on a copy and writes it back
    transcript: Mutex<Conversation>,
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionRegistry>,
    active: ActiveSlot,
    shutdown: CancellationToken,
}

pub fn request_id() -> String {
    format!("req_{}", short_id())
}

pub fn stop_id() -> String {
    format!("stop_{}", short_id())
}

impl AgentService {
    pub fn new(
        agent: Option<AgentLoop>,
        connections: Arc<ConnectionManager>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            agent: agent.map(Arc::new),
            transcript: Mutex::new(Conversation::new()),
            connections,
            sessions,
            active: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie every run to a process-wide token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.agent.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.lock_active().is_some()
    }

    pub fn active_correlation_id(&self) -> Option<String> {
        self.lock_active().as_ref().map(|r| r.correlation_id.clone())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_transcript(&self) -> MutexGuard<'_, Conversation> {
        self.transcript.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn agent(&self) -> Result<&Arc<AgentLoop>, ServiceError> {
        self.agent.as_ref().ok_or(ServiceError::NotReady)
    }

    fn claim(
        &self,
        correlation_id: &str,
        session_id: Option<&str>,
    ) -> Result<(CancellationToken, RunSlot), ServiceError> {
        let mut active = self.lock_active();
        if let Some(run) = active.as_ref() {
            return Err(ServiceError::Busy(run.correlation_id.clone()));
        }
        let cancel = self.shutdown.child_token();
        *active = Some(ActiveRun {
            correlation_id: correlation_id.to_string(),
            cancel: cancel.clone(),
        });
        drop(active);

        if let Some(sid) = session_id {
            self.sessions.update_session_state(sid, Some(true), Some(correlation_id));
        }
        let slot = RunSlot {
            active: Arc::clone(&self.active),
            correlation_id: correlation_id.to_string(),
            session: session_id.map(|sid| (Arc::clone(&self.sessions), sid.to_string())),
        };
        Ok((cancel, slot))
    }

    /// Start a broadcast run in the background. Returns its correlation id.
    pub fn start_stream(
        self: &Arc<Self>,
        content: String,
        correlation_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<String, ServiceError> {
        let agent = self.agent()?.clone();
        let cid = correlation_id.unwrap_or_else(request_id);
        let (cancel, slot) = self.claim(&cid, session_id.as_deref())?;

        let this = Arc::clone(self);
        let run_cid = cid.clone();
        tokio::spawn(async move {
            this.drive(&agent, content, run_cid, session_id, cancel, slot).await;
        });
        Ok(cid)
    }

    /// Broadcast run awaited in place. Returns the terminal step.
    pub async fn run_stream(
        &self,
        content: String,
        correlation_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<AgentStep, ServiceError> {
        let agent = self.agent()?.clone();
        let cid = correlation_id.unwrap_or_else(request_id);
        let (cancel, slot) = self.claim(&cid, session_id.as_deref())?;
        Ok(self.drive(&agent, content, cid, session_id, cancel, slot).await)
    }

    async fn drive(
        &self,
        agent: &AgentLoop,
        content: String,
        cid: String,
        session_id: Option<String>,
        cancel: CancellationToken,
        slot: RunSlot,
    ) -> AgentStep {
        let preview: String = content.chars().take(50).collect();
        info!(cid = %cid, session_id = ?session_id, message = %preview, "Starting streamed run");

        let mut conversation = self.lock_transcript().clone();
        conversation.push(Message::user(content));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = async {
            let tx = tx;
            agent.run(&mut conversation, &tx, &cancel).await
        };
        let forward = async {
            while let Some(step) = rx.recv().await {
                for event in ServerEvent::from_step(&step, &cid) {
                    self.publish(event, &cid, session_id.as_deref()).await;
                }
            }
        };
        let (terminal, ()) = tokio::join!(run, forward);

        *self.lock_transcript() = conversation;
        drop(slot);
        info!(
            cid = %cid,
            phase = %terminal.phase,
            steps = terminal.step_number,
            "Streamed run finished"
        );
        terminal
    }

    async fn publish(&self, event: ServerEvent, cid: &str, session_id: Option<&str>) {
        let value = event.to_value();
        if let Some(sid) = session_id {
            self.sessions.record_message(sid, value.clone());
        }
        self.connections.broadcast(value, Some(cid)).await;
    }

    /// Synchronous run; the steps come back in the summary instead of being
    /// broadcast.
    pub async fn chat(&self, content: &str) -> Result<RunSummary, ServiceError> {
        let agent = self.agent()?.clone();
        let cid = request_id();
        let (cancel, slot) = self.claim(&cid, None)?;

        let mut conversation = self.lock_transcript().clone();
        conversation.push(Message::user(content));
        let summary = agent.process_until(&mut conversation, &cancel).await;

        *self.lock_transcript() = conversation;
        drop(slot);
        info!(cid = %cid, success = summary.success, steps = summary.steps.len(), "Chat finished");
        Ok(summary)
    }

    /// Cancel the active run, if any, and tell every client.
    pub async fn stop(&self, correlation_id: Option<String>) -> Result<String, ServiceError> {
        let agent = self.agent()?.clone();
        let cid = correlation_id.unwrap_or_else(stop_id);
        let active = self
            .lock_active()
            .as_ref()
            .map(|r| (r.correlation_id.clone(), r.cancel.clone()));
        match active {
            Some((run_cid, cancel)) => {
                info!(cid = %cid, run = %run_cid, "Agent stop requested");
                cancel.cancel();
            }
            None => info!(cid = %cid, "Stop requested with no active run"),
        }

        let event = ServerEvent::Stopped {
            step_number: agent.current_step(),
            content: "Agent stopped by user".into(),
            correlation_id: Some(cid.clone()),
        };
        self.connections.broadcast(event.to_value(), Some(&cid)).await;
        Ok(cid)
    }

    /// Clear the transcript. Refused while a run is active.
    pub fn reset(&self) -> Result<(), ServiceError> {
        let agent = self.agent()?;
        if let Some(cid) = self.active_correlation_id() {
            warn!(cid = %cid, "Reset refused while a run is active");
            return Err(ServiceError::Busy(cid));
        }
        agent.reset(&mut self.lock_transcript());
        info!("Agent conversation cleared");
        Ok(())
    }

    /// Force the backend circuit closed.
    pub async fn reset_circuit(&self) -> Result<GatewayStatus, ServiceError> {
        let gateway = self.agent()?.gateway();
        gateway.reset_circuit();
        Ok(gateway.status().await)
    }

    pub async fn status(&self) -> Option<AgentStatus> {
        let agent = self.agent.as_ref()?;
        let conversation = self.lock_transcript().clone();
        Some(agent.status(&conversation).await)
    }

    pub fn transcript(&self) -> Conversation {
        self.lock_transcript().clone()
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let agent = match &self.agent {
            Some(agent) => Some(AgentSnapshot {
                current_step: agent.current_step(),
                running: self.is_running(),
                status: self.status().await.and_then(|s| serde_json::to_value(s).ok()),
            }),
            None => None,
        };
        let transcript = self.transcript();
        StateSnapshot::new(agent, &transcript.messages, self.sessions.snapshots())
    }

    pub async fn save_state(&self, path: &Path) -> Result<(), SnapshotError> {
        snapshot::save_state(path, &self.snapshot().await).await
    }
}
