//! `slowhands config`: configuration management commands.

use slowhands_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed and validated");

            let warnings = advisories(&config);
            if !warnings.is_empty() {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Provider:  {}", config.default_provider);
            println!("   Model:     {}", slowhands_providers::resolve_model(&config));
            println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
            println!("   Workspace: {}", config.workspace_path.display());
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let mut redacted = config.clone();
    if redacted.api_key.is_some() {
        redacted.api_key = Some("[REDACTED]".into());
    }
    for provider in redacted.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("[REDACTED]".into());
        }
    }
    println!("{}", toml::to_string_pretty(&redacted)?);
    Ok(())
}

/// Settings that load fine but are probably not what the user wants.
fn advisories(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if !config.has_api_key() && !config.providers.values().any(|p| p.api_key.is_some()) {
        warnings.push("No API key set (SLOWHANDS_API_KEY, OPENAI_API_KEY or OPENROUTER_API_KEY)");
    }
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway bound to 0.0.0.0; every interface can reach the agent");
    }
    if config.gateway.ping_interval_secs >= config.gateway.connection_timeout_secs {
        warnings.push(
            "ping_interval_secs is not below connection_timeout_secs; idle clients will be swept",
        );
    }
    if config.reliability.rate_limit_rpm == 0 && config.reliability.rate_limit_tpm == 0 {
        warnings.push("Rate limiting is disabled");
    }
    warnings
}
