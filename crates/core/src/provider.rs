//! Provider trait: the abstraction over language-model backends.
//!
//! A provider takes the transcript and the tool catalog and returns the next
//! assistant turn. The gateway treats it as an opaque, possibly failing
//! remote call; which service sits behind it does not matter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Message;

/// Tokens reserved for the response when estimating a request's cost.
pub const RESPONSE_TOKEN_BUFFER: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tools the model may call this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    /// Rough token cost used for rate-limit admission: four characters per
    /// token over the whole transcript, plus a fixed response buffer.
    pub fn estimated_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        let prompt = u32::try_from(chars / 4).unwrap_or(u32::MAX);
        prompt.saturating_add(RESPONSE_TOKEN_BUFFER)
    }
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The assistant turn: optional text plus any requested tool calls
    pub message: Message,

    pub usage: Option<Usage>,

    /// Why generation stopped (`stop`, `tool_calls`, `length`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The backend contract.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Whether a failure from this backend is worth retrying.
    ///
    /// Backends with their own failure vocabulary override this; the default
    /// follows [`ProviderError::is_retryable`].
    fn is_retryable(&self, error: &ProviderError) -> bool {
        error.is_retryable()
    }
}
