//! # SlowHands Core
//!
//! Domain types, traits, and error definitions for the SlowHands agent runtime.
//! This crate has **no runtime dependencies**: it defines the model that the
//! resilience, provider, agent, and gateway crates implement against.
//!
//! - [`Provider`] is the language-model backend contract.
//! - [`Tool`] is the side-effecting capability contract, dispatched by name
//!   through a [`ToolRegistry`].
//! - [`AgentStep`] is the unit of progress a run emits to clients.

pub mod error;
pub mod message;
pub mod provider;
pub mod step;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{DeliveryError, GatewayError, ProviderError, ToolError};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use step::{AgentStep, Phase};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
