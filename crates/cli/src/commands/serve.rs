//! `slowhands serve`: start the gateway.

use slowhands_config::AppConfig;
use slowhands_core::tool::ToolRegistry;
use slowhands_gateway::GatewayState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn run(
    port_override: Option<u16>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    // Tools are supplied by embedders; the stock server runs a chat-only agent.
    let agent = match slowhands_gateway::build_agent(&config, Arc::new(ToolRegistry::new())) {
        Ok(agent) => Some(agent),
        Err(e) => {
            warn!(error = %e, "Agent unavailable; serving without one");
            None
        }
    };

    eprintln!("SlowHands gateway");
    eprintln!("   Listening:  ws://{}:{}/ws", config.gateway.host, config.gateway.port);
    eprintln!("   Provider:   {}", config.default_provider);
    eprintln!("   Workspace:  {}", config.workspace_path.display());
    eprintln!("   Agent:      {}", if agent.is_some() { "ready" } else { "not configured" });

    let state = Arc::new(GatewayState::new(&config, agent, shutdown));
    slowhands_gateway::start(&config, state).await?;
    Ok(())
}
