//! Claude CLI provider.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::provider::{probe_cli, run_cli, selected_model_arg, Provider, Result};

pub struct ClaudeProvider {
    cli_path: String,
    default_model: String,
}

impl ClaudeProvider {
    pub fn new() -> Self {
        Self::with_cli_path("claude")
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            default_model: "sonnet".to_string(),
        }
    }

    fn command(&self, prompt: &str, model: Option<&str>, working_dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("-p").arg(prompt);

        if let Some(m) = selected_model_arg(model) {
            cmd.arg("--model").arg(m);
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
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
        run_cli(self.command(prompt, model, working_dir), cancel).await
    }

    fn default_model(&self) -> Option<&str> {
        Some(&self.default_model)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn passes_prompt_then_model_flags() {
        let dir = TempDir::new().unwrap();
        let provider = ClaudeProvider::with_cli_path("echo");

        let out = provider
            .complete("hello", Some("opus"), Some(dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "-p hello --model opus");
    }

    #[tokio::test]
    async fn default_model_is_not_passed() {
        let provider = ClaudeProvider::with_cli_path("echo");
        let out = provider
            .complete("hi", Some("default"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "-p hi");
    }

    #[tokio::test]
    async fn missing_cli_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let missing = ClaudeProvider::with_cli_path(dir.path().join("nope").display().to_string());
        assert!(!missing.is_available().await);
    }
}
