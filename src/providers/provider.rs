//! AI provider trait.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// An agent back-end: turns a prompt into text.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Check if the provider is usable (CLI installed or endpoint reachable).
    async fn is_available(&self) -> bool;

    /// Complete a prompt. `fresh` requests a new session instead of
    /// continuing the agent's previous one.
    async fn complete(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: Option<&Path>,
        fresh: bool,
    ) -> Result<String>;

    /// Default model tag.
    fn default_model(&self) -> Option<&str>;
}

impl ProviderError {
    pub fn other(s: impl Into<String>) -> Self {
        ProviderError::Other(s.into())
    }
}
