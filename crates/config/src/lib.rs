//! Configuration loading and validation for SlowHands.
//!
//! Loads configuration from `~/.slowhands/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.slowhands/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Directory the agent works in; `open_file` and `/api/files` are
    /// confined to it
    #[serde(default = "default_workspace_path")]
    pub workspace_path: PathBuf,

    /// Backend admission control and retry settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_workspace_path() -> PathBuf {
    AppConfig::config_dir().join("workspace")
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("workspace_path", &self.workspace_path)
            .field("reliability", &self.reliability)
            .field("agent", &self.agent)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Rate limiting, circuit breaking, and retry cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Per-attempt timeout on backend requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_min_wait")]
    pub retry_min_wait_secs: f64,

    #[serde(default = "default_retry_max_wait")]
    pub retry_max_wait_secs: f64,

    /// Requests per minute (0 = disabled)
    #[serde(default = "default_rpm")]
    pub rate_limit_rpm: u32,

    /// Tokens per minute (0 = disabled)
    #[serde(default = "default_tpm")]
    pub rate_limit_tpm: u32,

    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub tool_retry_attempts: u32,

    #[serde(default = "default_retry_min_wait")]
    pub tool_retry_min_wait_secs: f64,

    #[serde(default = "default_tool_retry_max_wait")]
    pub tool_retry_max_wait_secs: f64,

    /// Per-attempt timeout on a single tool execution
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_min_wait() -> f64 {
    1.0
}
fn default_retry_max_wait() -> f64 {
    60.0
}
fn default_rpm() -> u32 {
    60
}
fn default_tpm() -> u32 {
    90_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_timeout() -> u64 {
    60
}
fn default_tool_retry_max_wait() -> f64 {
    10.0
}
fn default_tool_timeout() -> u64 {
    120
}

impl ReliabilityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_min_wait_secs: default_retry_min_wait(),
            retry_max_wait_secs: default_retry_max_wait(),
            rate_limit_rpm: default_rpm(),
            rate_limit_tpm: default_tpm(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_timeout_secs: default_breaker_timeout(),
            tool_retry_attempts: default_retry_attempts(),
            tool_retry_min_wait_secs: default_retry_min_wait(),
            tool_retry_max_wait_secs: default_tool_retry_max_wait(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

/// Control loop bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock bound on one think/act iteration
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_step_timeout() -> u64 {
    60
}
fn default_system_prompt() -> String {
    "You are SlowHands, a careful coding agent. Work step by step, use the \
     available tools when they help, and answer plainly when you are done."
        .into()
}

impl AgentConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            step_timeout_secs: default_step_timeout(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// WebSocket/HTTP server and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Capacity of the undelivered-event queue (0 = unbounded)
    #[serde(default = "default_queue_size")]
    pub message_queue_max_size: usize,

    /// Idle time after which a connection is considered stale
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub stale_sweep_interval_secs: u64,

    /// Keepalive ping cadence (0 = no server pings)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Events retained per session for replay on resume
    #[serde(default = "default_session_log_capacity")]
    pub session_log_capacity: usize,

    /// Where shutdown snapshots are written
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_port() -> u16 {
    8765
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_queue_size() -> usize {
    100
}
fn default_connection_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    20
}
fn default_session_log_capacity() -> usize {
    100
}
fn default_state_file() -> PathBuf {
    AppConfig::config_dir().join("agent_state.json")
}

impl GatewayConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            message_queue_max_size: default_queue_size(),
            connection_timeout_secs: default_connection_timeout(),
            stale_sweep_interval_secs: default_sweep_interval(),
            ping_interval_secs: default_ping_interval(),
            session_log_capacity: default_session_log_capacity(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.slowhands/config.toml).
    ///
    /// Environment overrides:
    /// - `SLOWHANDS_API_KEY`, then `OPENAI_API_KEY`, then `OPENROUTER_API_KEY`
    /// - `SLOWHANDS_PROVIDER`, `SLOWHANDS_MODEL`, `SLOWHANDS_WORKSPACE`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("SLOWHANDS_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("SLOWHANDS_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("SLOWHANDS_MODEL") {
            self.default_model = model;
        }

        if let Ok(workspace) = std::env::var("SLOWHANDS_WORKSPACE") {
            self.workspace_path = PathBuf::from(workspace);
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".slowhands")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let r = &self.reliability;
        if r.retry_attempts == 0 || r.tool_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry_attempts and tool_retry_attempts must be at least 1".into(),
            ));
        }
        if r.retry_min_wait_secs < 0.0 || r.retry_min_wait_secs > r.retry_max_wait_secs {
            return Err(ConfigError::ValidationError(
                "retry_min_wait_secs must be between 0 and retry_max_wait_secs".into(),
            ));
        }
        if r.tool_retry_min_wait_secs < 0.0
            || r.tool_retry_min_wait_secs > r.tool_retry_max_wait_secs
        {
            return Err(ConfigError::ValidationError(
                "tool_retry_min_wait_secs must be between 0 and tool_retry_max_wait_secs".into(),
            ));
        }
        if r.circuit_breaker_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker_threshold must be at least 1".into(),
            ));
        }

        if self.agent.step_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.step_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.gateway.stale_sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.stale_sweep_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            workspace_path: default_workspace_path(),
            reliability: ReliabilityConfig::default(),
            agent: AgentConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
