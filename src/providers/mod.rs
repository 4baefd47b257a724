//! AI providers module.

use std::sync::Arc;

pub mod claude;
pub mod codex;
pub mod ollama;
pub mod provider;

pub use provider::{Provider, ProviderError, Result};

use crate::config::Settings;

/// Provider factory.
pub fn create_provider(name: &str, settings: &Settings) -> Arc<dyn Provider> {
    match name {
        "codex" => Arc::new(codex::CodexProvider::new()),
        "ollama" => {
            if let Some(url) = &settings.models.ollama_base_url {
                Arc::new(ollama::OllamaProvider::with_base_url(url.clone()))
            } else {
                Arc::new(ollama::OllamaProvider::new())
            }
        }
        _ => Arc::new(claude::ClaudeProvider::new()),
    }
}

/// Check if a provider is available.
pub async fn is_provider_available(name: &str, settings: &Settings) -> bool {
    let provider = create_provider(name, settings);
    provider.is_available().await
}
