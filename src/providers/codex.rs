//! Codex CLI provider.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use super::provider::{Provider, ProviderError, Result};

pub struct CodexProvider {
    cli_path: String,
}

impl CodexProvider {
    pub fn new() -> Self {
        Self {
            cli_path: "codex".to_string(),
        }
    }
}

impl Default for CodexProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for CodexProvider {
    fn name(&self) -> &str {
        "codex"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.cli_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| true)
            .unwrap_or(false)
    }

    async fn complete(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: Option<&Path>,
        fresh: bool,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("exec");
        // codex resumes its last session unless told otherwise.
        if !fresh {
            cmd.arg("resume").arg("--last");
        }
        cmd.arg(prompt);

        if let Some(m) = model.filter(|m| !m.is_empty() && *m != "default") {
            cmd.arg("--model").arg(m);
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProviderError::ApiError(stderr.to_string()))
        }
    }

    fn default_model(&self) -> Option<&str> {
        None
    }
}
