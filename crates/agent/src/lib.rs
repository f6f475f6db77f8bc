//! The agent control loop for SlowHands.
//!
//! The agent follows a **Think → Act → Observe → Respond** cycle:
//!
//! 1. **Think**: send the transcript and tool catalog to the backend gateway
//! 2. **Act**: execute each requested tool call, with its own retries
//! 3. **Observe**: append tool results to the transcript and think again
//! 4. **Respond**: a turn without tool calls is the final answer
//!
//! The loop is bounded by an iteration cap and a per-iteration timeout, and
//! stops cooperatively when its cancellation token fires.

pub mod loop_runner;
pub mod tool_executor;

pub use loop_runner::{AgentLoop, AgentStatus, RunSummary};
pub use tool_executor::{ToolExecutor, parse_tool_call};
