//! Wire messages exchanged over the WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator and an optional
//! `correlation_id` tying it to the request that caused it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slowhands_core::step::{AgentStep, Phase};
use thiserror::Error;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat {
        content: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    Stop {
        #[serde(default)]
        correlation_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        correlation_id: Option<String>,
    },
    Pong {
        #[serde(default)]
        correlation_id: Option<String>,
    },
    OpenFile {
        path: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    ResumeSession {
        session_id: String,
        #[serde(default)]
        last_correlation_id: Option<String>,
        #[serde(default)]
        correlation_id: Option<String>,
    },
}

const CLIENT_TYPES: &[&str] = &["chat", "stop", "ping", "pong", "open_file", "resume_session"];

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Decode a text frame from a client.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let kind = match value.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "None".to_string(),
    };
    if !CLIENT_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Step {
        step_number: u32,
        phase: Phase,
        content: String,
        tool_name: Option<String>,
        tool_success: Option<bool>,
        correlation_id: Option<String>,
    },
    Complete {
        step_number: u32,
        content: String,
        correlation_id: Option<String>,
    },
    Error {
        step_number: u32,
        content: String,
        correlation_id: Option<String>,
    },
    Stopped {
        step_number: u32,
        content: String,
        correlation_id: Option<String>,
    },
    Pong {
        correlation_id: Option<String>,
    },
    FileContent {
        path: String,
        content: String,
        size: usize,
        lines: usize,
        correlation_id: Option<String>,
    },
    SessionState {
        session_id: String,
        is_new: bool,
        agent_running: bool,
        last_correlation_id: Option<String>,
        /// Events about to be replayed after this frame
        pending_messages: usize,
        correlation_id: Option<String>,
    },
}

impl ServerEvent {
    /// An error frame not tied to any step.
    pub fn error(content: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self::Error {
            step_number: 0,
            content: content.into(),
            correlation_id,
        }
    }

    /// The frames a step produces. A failed step becomes a single `error`
    /// frame; any other step is a `step` frame, followed by `complete` or
    /// `stopped` when it ends the run.
    pub fn from_step(step: &AgentStep, correlation_id: &str) -> Vec<Self> {
        let cid = Some(correlation_id.to_string());
        let (step_number, content) = (step.step_number, step.content.clone());
        if step.phase == Phase::Error {
            return vec![Self::Error {
                step_number,
                content,
                correlation_id: cid,
            }];
        }

        let mut events = vec![Self::Step {
            step_number: step.step_number,
            phase: step.phase,
            content: step.content.clone(),
            tool_name: step.tool_name().map(String::from),
            tool_success: step.tool_success(),
            correlation_id: cid.clone(),
        }];
        match step.phase {
            Phase::Respond => events.push(Self::Complete {
                step_number,
                content,
                correlation_id: cid,
            }),
            Phase::Stopped => events.push(Self::Stopped {
                step_number,
                content,
                correlation_id: cid,
            }),
            Phase::Think | Phase::Act | Phase::Observe | Phase::Error => {}
        }
        events
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
