//! Backend selection from configuration.

use slowhands_config::AppConfig;
use slowhands_core::error::ProviderError;
use slowhands_core::provider::Provider;
use std::sync::Arc;
use tracing::info;

use crate::openai_compat::OpenAiCompatProvider;

/// Providers that run on the local machine and accept any key.
const KEYLESS_PROVIDERS: &[&str] = &["ollama", "vllm", "llamacpp", "llama.cpp"];

/// Build the configured default backend.
///
/// Per-provider settings in `[providers.<name>]` take precedence over the
/// root `api_key` and the well-known base URL. Remote providers without any
/// key are rejected with [`ProviderError::NotConfigured`].
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.default_provider.as_str();
    let provider_config = config.providers.get(name);

    let api_key = provider_config
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone());
    let api_key = match api_key {
        Some(key) => key,
        None if KEYLESS_PROVIDERS.contains(&name) => name.to_string(),
        None => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{name}' (set api_key or SLOWHANDS_API_KEY)"
            )));
        }
    };

    let base_url = provider_config
        .and_then(|p| p.api_url.clone())
        .unwrap_or_else(|| default_base_url(name));

    info!(provider = %name, base_url = %base_url, "Backend configured");
    Ok(Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)))
}

/// The model to request: a per-provider override, else the root default.
pub fn resolve_model(config: &AppConfig) -> String {
    config
        .providers
        .get(&config.default_provider)
        .and_then(|p| p.default_model.clone())
        .unwrap_or_else(|| config.default_model.clone())
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slowhands_config::ProviderConfig;

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").contains("openrouter.ai"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }

    #[test]
    fn missing_key_is_not_configured() {
        let config = AppConfig::default();
        let err = build_from_config(&config).err().unwrap();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn local_provider_needs_no_key() {
        let config = AppConfig {
            default_provider: "ollama".into(),
            ..AppConfig::default()
        };
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn provider_section_overrides_root() {
        let mut config = AppConfig {
            api_key: Some("root-key".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: None,
                api_url: Some("http://proxy.internal/v1".into()),
                default_model: Some("gpt-4o-mini".into()),
            },
        );
        assert!(build_from_config(&config).is_ok());
        assert_eq!(resolve_model(&config), "gpt-4o-mini");
    }
}
