//! `slowhands status`: configuration summary plus the last saved snapshot.

use slowhands_config::AppConfig;
use slowhands_gateway::load_state;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!("SlowHands Status");
    println!("================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Workspace:    {}", config.workspace_path.display());
    println!("  Provider:     {}", config.default_provider);
    println!("  Model:        {}", slowhands_providers::resolve_model(&config));
    println!("  Gateway:      {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "  Limits:       {} rpm, {} tpm, breaker after {} failures",
        config.reliability.rate_limit_rpm,
        config.reliability.rate_limit_tpm,
        config.reliability.circuit_breaker_threshold
    );

    match load_state(&config.gateway.state_file).await {
        Ok(Some(snapshot)) => {
            println!();
            println!("  Last saved:   {}", snapshot.saved_at.to_rfc3339());
            if let Some(agent) = &snapshot.agent {
                println!("  Last step:    {} (running: {})", agent.current_step, agent.running);
            }
            println!("  Transcript:   {} messages kept", snapshot.transcript.len());
            println!("  Sessions:     {}", snapshot.sessions.len());
            for session in &snapshot.sessions {
                println!(
                    "    {}  last={}  pending={}",
                    session.session_id,
                    session.last_correlation_id.as_deref().unwrap_or("-"),
                    session.pending_count
                );
            }
        }
        Ok(None) => println!("\n  No saved state at {}", config.gateway.state_file.display()),
        Err(e) => println!("\n  Saved state unreadable: {e}"),
    }

    Ok(())
}
