//! Codex CLI provider.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::provider::{probe_cli, run_cli, selected_model_arg, Provider, Result};

pub struct CodexProvider {
    cli_path: String,
    default_model: String,
}

impl CodexProvider {
    pub fn new() -> Self {
        Self::with_cli_path("codex")
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            default_model: "gpt-5.3-codex".to_string(),
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
        probe_cli(&self.cli_path).await
    }

    async fn complete(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.cli_path);
        // Non-interactive mode; flags go before the prompt.
        cmd.arg("exec").arg("--skip-git-repo-check");

        if let Some(m) = selected_model_arg(model) {
            cmd.arg("--model").arg(m);
        }

        cmd.arg(prompt);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        run_cli(cmd, cancel).await
    }

    fn default_model(&self) -> Option<&str> {
        Some(&self.default_model)
    }
}
