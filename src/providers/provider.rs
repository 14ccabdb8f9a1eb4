//! AI Provider trait for agentloop.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,
}

impl ProviderError {
    /// Process exit code, when the provider ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProviderError::Exit { code, .. } => *code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// AI Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Check if the provider CLI is installed.
    async fn is_available(&self) -> bool;

    /// Complete a prompt. Cancelling `cancel` terminates the child process.
    async fn complete(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Get the default model.
    fn default_model(&self) -> Option<&str>;
}

/// Treat "default" and blank model names as "let the CLI choose".
pub(crate) fn selected_model_arg(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "default")
        .map(ToString::to_string)
}

/// Probe a CLI by running `--version`.
pub(crate) async fn probe_cli(cli_path: &str) -> bool {
    Command::new(cli_path)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run a prepared command, returning trimmed stdout.
pub(crate) async fn run_cli(mut cmd: Command, cancel: &CancellationToken) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let output = tokio::select! {
        out = child.wait_with_output() => out?,
        // Dropping the wait future drops the child, which kills it.
        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ProviderError::Exit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
