//! Agent invocation seam.
//!
//! The dispatcher only ever talks to the `Invoker` trait; the production
//! implementation resolves the agent's provider, composes the system prompt,
//! and runs the completion under an execution contract (timeout plus one
//! bounded retry). Tests substitute a scripted invoker.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::providers::{create_provider, Provider};

/// Reply substituted when a provider fails; the message still completes.
pub const FALLBACK_APOLOGY: &str =
    "Sorry, something went wrong while handling that message. Please try again.";

/// Opaque prompt -> text capability.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run `prompt` against `agent_id`'s back-end. `reset` requests a fresh
    /// session instead of continuing the previous one.
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        reset: bool,
        settings: &Settings,
    ) -> Result<String>;
}

/// Timeout and retry policy for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout_seconds: 240,
            retries: 1,
            retry_backoff_ms: 600,
        }
    }
}

impl ExecutionContract {
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            // Local models are slower to first token.
            "ollama" => Self {
                timeout_seconds: 420,
                retries: 1,
                retry_backoff_ms: 800,
            },
            _ => Self::default(),
        }
    }
}

async fn execute_with_contract(
    provider: Arc<dyn Provider>,
    prompt: &str,
    model: Option<&str>,
    working_dir: Option<&Path>,
    fresh: bool,
    contract: &ExecutionContract,
) -> Result<String> {
    let attempts = contract.retries + 1;
    let timeout = Duration::from_secs(contract.timeout_seconds);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = tokio::time::timeout(
            timeout,
            provider.complete(prompt, model, working_dir, fresh),
        )
        .await;
        match result {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                last_error = e.to_string();
                tracing::warn!(
                    "Invocation attempt {}/{} via {} failed: {}",
                    attempt,
                    attempts,
                    provider.name(),
                    last_error
                );
            }
            Err(_) => {
                last_error = format!(
                    "completion exceeded timeout of {}s",
                    contract.timeout_seconds
                );
                tracing::warn!(
                    "Invocation attempt {}/{} via {} timed out",
                    attempt,
                    attempts,
                    provider.name()
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(contract.retry_backoff_ms)).await;
        }
    }

    Err(Error::Provider(format!(
        "[{}] {}",
        provider.name(),
        last_error
    )))
}

/// Production invoker backed by the provider registry.
pub struct ProviderInvoker {
    home: PathBuf,
}

impl ProviderInvoker {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn compose_prompt(agent: &crate::config::AgentConfig, prompt: &str) -> String {
        let mut system = String::new();
        if let Some(path) = &agent.prompt_file {
            match std::fs::read_to_string(path) {
                Ok(text) => system.push_str(text.trim()),
                Err(e) => tracing::warn!("Could not read prompt file {}: {}", path.display(), e),
            }
        }
        if let Some(text) = agent.system_prompt.as_deref() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(text.trim());
        }
        if system.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", system, prompt)
        }
    }
}

#[async_trait]
impl Invoker for ProviderInvoker {
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        reset: bool,
        settings: &Settings,
    ) -> Result<String> {
        let agent = settings
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("Agent not found: {}", agent_id)))?;

        let provider_name = agent
            .provider
            .clone()
            .unwrap_or_else(|| settings.models.provider.clone());
        let provider = create_provider(&provider_name, settings);

        let working_dir = settings.agent_working_dir(agent_id, &self.home);
        std::fs::create_dir_all(&working_dir)?;

        let full_prompt = Self::compose_prompt(agent, prompt);
        let contract = ExecutionContract::for_provider(&provider_name);

        execute_with_contract(
            provider,
            &full_prompt,
            agent.model.as_deref(),
            Some(&working_dir),
            reset,
            &contract,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn test_compose_prompt_prepends_system() {
        let agent = AgentConfig {
            system_prompt: Some("You are terse.".to_string()),
            ..Default::default()
        };
        let composed = ProviderInvoker::compose_prompt(&agent, "hello");
        assert_eq!(composed, "You are terse.\n\nhello");

        let bare = AgentConfig::default();
        assert_eq!(ProviderInvoker::compose_prompt(&bare, "hello"), "hello");
    }

    #[test]
    fn test_compose_prompt_reads_prompt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("role.md");
        std::fs::write(&path, "Role file.\n").unwrap();

        let agent = AgentConfig {
            prompt_file: Some(path),
            system_prompt: Some("Inline too.".to_string()),
            ..Default::default()
        };
        let composed = ProviderInvoker::compose_prompt(&agent, "hi");
        assert_eq!(composed, "Role file.\n\nInline too.\n\nhi");
    }
}
