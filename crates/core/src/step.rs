//! Agent steps: the unit of progress a run reports to its clients.

use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// Where the control loop is.
///
/// `Observe` is the loop's internal state between acting and thinking again;
/// tool outcomes reach clients on the `Act` step that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Think,
    Act,
    Observe,
    Respond,
    Error,
    Stopped,
}

impl Phase {
    /// Whether a step in this phase ends the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Respond | Self::Error | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Think => "think",
            Self::Act => "act",
            Self::Observe => "observe",
            Self::Respond => "respond",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a run. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Monotonic within a run, starting at 1
    pub step_number: u32,
    pub phase: Phase,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl AgentStep {
    pub fn new(step_number: u32, phase: Phase, content: impl Into<String>) -> Self {
        Self {
            step_number,
            phase,
            content: content.into(),
            tool_call: None,
            tool_result: None,
        }
    }

    pub fn with_tool(mut self, call: ToolCall, result: ToolResult) -> Self {
        self.tool_call = Some(call);
        self.tool_result = Some(result);
        self
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool_call.as_ref().map(|c| c.name.as_str())
    }

    pub fn tool_success(&self) -> Option<bool> {
        self.tool_result.as_ref().map(|r| r.success)
    }
}
