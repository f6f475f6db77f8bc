//! On-disk snapshot of the agent and session state, written at shutdown
//! for inspection and recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slowhands_core::message::{Message, Role};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::session::SessionState;

pub const SNAPSHOT_VERSION: &str = "1.0";

/// Messages kept from the end of the transcript.
pub const TRANSCRIPT_TAIL: usize = 20;

/// Characters kept per message.
pub const CONTENT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub current_step: u32,
    pub running: bool,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

impl TranscriptEntry {
    pub fn from_message(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.chars().take(CONTENT_LIMIT).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub saved_at: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub agent: Option<AgentSnapshot>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub sessions: Vec<SessionState>,
}

impl StateSnapshot {
    pub fn new(
        agent: Option<AgentSnapshot>,
        messages: &[Message],
        sessions: Vec<SessionState>,
    ) -> Self {
        let start = messages.len().saturating_sub(TRANSCRIPT_TAIL);
        Self {
            saved_at: Utc::now(),
            version: SNAPSHOT_VERSION.to_string(),
            agent,
            transcript: messages[start..].iter().map(TranscriptEntry::from_message).collect(),
            sessions,
        }
    }
}

/// Write a snapshot as pretty JSON, creating parent directories.
pub async fn save_state(path: &Path, snapshot: &StateSnapshot) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    tokio::fs::write(path, json).await?;
    info!(path = %path.display(), sessions = snapshot.sessions.len(), "State saved");
    Ok(())
}

/// Read a snapshot back. A missing file is `Ok(None)`.
pub async fn load_state(path: &Path) -> Result<Option<StateSnapshot>, SnapshotError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No saved state");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot: StateSnapshot = serde_json::from_str(&raw)?;
    info!(path = %path.display(), saved_at = %snapshot.saved_at, "State loaded");
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_tailed_and_truncated() {
        let mut messages: Vec<Message> = (0..30).map(|i| Message::user(format!("m{i}"))).collect();
        messages.push(Message::assistant("x".repeat(5000)));

        let snapshot = StateSnapshot::new(None, &messages, Vec::new());
        assert_eq!(snapshot.transcript.len(), TRANSCRIPT_TAIL);
        assert_eq!(snapshot.transcript[0].content, "m11");
        assert_eq!(snapshot.transcript.last().unwrap().content.len(), CONTENT_LIMIT);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/agent_state.json");
        let snapshot = StateSnapshot::new(
            Some(AgentSnapshot {
                current_step: 3,
                running: false,
                status: None,
            }),
            &[Message::user("hello")],
            vec![SessionState {
                session_id: "s1".into(),
                last_correlation_id: Some("req_1".into()),
                agent_running: false,
                pending_count: 2,
            }],
        );

        save_state(&path, &snapshot).await.unwrap();
        let loaded = load_state(&path).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join("absent.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_state(&path).await, Err(SnapshotError::Json(_))));
    }
}
