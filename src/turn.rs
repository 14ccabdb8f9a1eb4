//! Model turn adapter: one prompt/response exchange with the provider CLI.
//!
//! The autonomy runtime treats this as an opaque capability. The provider
//! implementation assembles the prompt, applies the context guard, runs the
//! CLI under a timeout and classifies failures.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ContextGuard, Paths, Settings};
use crate::providers::{Provider, ProviderError};

/// Input for one model turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub workspace: PathBuf,
    pub ability_profile: Option<String>,
    pub model_provider: String,
    pub model: Option<String>,
    pub context_guard_enabled: bool,
    pub context_guard_threshold_pct: u8,
    pub user_message: String,
    pub quiet: bool,
}

impl TurnRequest {
    /// Request for `workspace` using the model settings in `settings`.
    pub fn from_settings(settings: &Settings, workspace: PathBuf, user_message: &str) -> Self {
        Self {
            workspace,
            ability_profile: settings.ability_profile.clone(),
            model_provider: settings.models.provider.clone(),
            model: settings.models.model.clone(),
            context_guard_enabled: settings.context_guard.enabled,
            context_guard_threshold_pct: settings.context_guard.threshold_pct,
            user_message: user_message.to_string(),
            quiet: true,
        }
    }
}

/// Result of one model turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnOutcome {
    pub ok: bool,
    pub response: String,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub memory_path: Option<PathBuf>,
}

impl TurnOutcome {
    pub fn success(response: impl Into<String>) -> Self {
        Self {
            ok: true,
            response: response.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Executes a single model turn. Implementations must stop promptly once
/// `cancel` fires.
#[async_trait]
pub trait TurnAdapter: Send + Sync {
    async fn run_turn(&self, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Timeout,
    Cancelled,
    Unauthorized,
    ProviderUnavailable,
    CliMissing,
    Unknown,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::Cancelled => write!(f, "cancelled"),
            FailureCode::Unauthorized => write!(f, "unauthorized"),
            FailureCode::ProviderUnavailable => write!(f, "provider_unavailable"),
            FailureCode::CliMissing => write!(f, "cli_missing"),
            FailureCode::Unknown => write!(f, "unknown"),
        }
    }
}

fn classify_error(error: &ProviderError) -> FailureCode {
    match error {
        ProviderError::Cancelled => FailureCode::Cancelled,
        ProviderError::Timeout => FailureCode::Timeout,
        ProviderError::IoError(e) if e.kind() == std::io::ErrorKind::NotFound => FailureCode::CliMissing,
        other => classify_message(&other.to_string().to_lowercase()),
    }
}

fn classify_message(m: &str) -> FailureCode {
    if m.contains("unauthorized") || m.contains("sign in") || m.contains("forbidden") || m.contains("log in") {
        FailureCode::Unauthorized
    } else if m.contains("command not found") || m.contains("no such file") {
        FailureCode::CliMissing
    } else if m.contains("not available") || m.contains("connection") || m.contains("failed to connect") {
        FailureCode::ProviderUnavailable
    } else {
        FailureCode::Unknown
    }
}

/// Apply the context guard to a user message.
///
/// When enabled and the message exceeds `threshold_pct` of
/// `max_prompt_chars`, the middle of the message is dropped so the head
/// (instructions) and tail (most recent context) survive.
pub fn guard_message(message: &str, guard: &ContextGuard, enabled: bool, threshold_pct: u8) -> String {
    if !enabled {
        return message.to_string();
    }
    let budget = guard.max_prompt_chars.saturating_mul(threshold_pct as usize) / 100;
    let len = message.chars().count();
    if len <= budget || budget == 0 {
        return message.to_string();
    }

    let marker = format!("\n[... {} characters trimmed by context guard ...]\n", len - budget);
    let marker_len = marker.chars().count();
    if marker_len >= budget {
        // No room for the marker; a hard cut is all that fits.
        return message.chars().take(budget).collect();
    }
    let keep = budget - marker_len;
    let head = keep / 2;
    let tail = keep - head;
    let head_text: String = message.chars().take(head).collect();
    let tail_text: String = message.chars().skip(len - tail).collect();
    format!("{}{}{}", head_text, marker, tail_text)
}

fn build_prompt(request: &TurnRequest, guarded_message: &str) -> String {
    let mut prompt = String::new();
    if let Some(profile) = request.ability_profile.as_deref().filter(|p| !p.trim().is_empty()) {
        prompt.push_str(&format!("Ability profile: {}\n", profile.trim()));
    }
    prompt.push_str(&format!("Workspace: {}\n\n", request.workspace.display()));
    prompt.push_str(guarded_message);
    prompt
}

/// [`TurnAdapter`] backed by a CLI [`Provider`].
pub struct ProviderTurnAdapter {
    provider: Arc<dyn Provider>,
    guard: ContextGuard,
    timeout: Duration,
    memory_dir: Option<PathBuf>,
}

impl ProviderTurnAdapter {
    pub fn new(provider: Arc<dyn Provider>, settings: &Settings) -> Self {
        Self {
            provider,
            guard: settings.context_guard.clone(),
            timeout: Duration::from_secs(settings.turn.timeout_secs.max(1)),
            memory_dir: None,
        }
    }

    /// Append a transcript line per turn under `paths.memory_dir()`.
    pub fn with_memory(mut self, paths: &Paths) -> Self {
        self.memory_dir = Some(paths.memory_dir());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn record_transcript(&self, request: &TurnRequest, outcome: &TurnOutcome) -> Option<PathBuf> {
        let dir = self.memory_dir.as_ref()?;
        let path = dir.join(format!("{}.jsonl", crate::workspace::hash(&request.workspace)));
        let rec = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "provider": self.provider.name(),
            "workspace": request.workspace,
            "prompt": request.user_message.chars().take(2000).collect::<String>(),
            "ok": outcome.ok,
            "response": outcome.response.chars().take(4000).collect::<String>(),
            "error": outcome.error_message,
        });
        let written = std::fs::create_dir_all(dir).and_then(|_| {
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(f, "{}", rec)
        });
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("Failed to append turn transcript {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl TurnAdapter for ProviderTurnAdapter {
    async fn run_turn(&self, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome {
        let guarded = guard_message(
            &request.user_message,
            &self.guard,
            request.context_guard_enabled,
            request.context_guard_threshold_pct,
        );
        let prompt = build_prompt(&request, &guarded);

        if !request.quiet {
            tracing::info!("Running {} turn in {}", self.provider.name(), request.workspace.display());
        }

        let completion = tokio::time::timeout(
            self.timeout,
            self.provider.complete(&prompt, request.model.as_deref(), Some(&request.workspace), &cancel),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));

        let mut outcome = match completion {
            Ok(text) => TurnOutcome::success(text),
            Err(e) => {
                let code = classify_error(&e);
                tracing::warn!("{} turn failed [{}]: {}", self.provider.name(), code, e);
                TurnOutcome {
                    exit_code: e.exit_code(),
                    ..TurnOutcome::failure(format!("[{}] {}", code, e))
                }
            }
        };
        outcome.memory_path = self.record_transcript(&request, &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            prompt: &str,
            _model: Option<&str>,
            _working_dir: Option<&Path>,
            cancel: &CancellationToken,
        ) -> crate::providers::Result<String> {
            if prompt.contains("hang") {
                cancel.cancelled().await;
                return Err(ProviderError::Cancelled);
            }
            if prompt.contains("fail") {
                return Err(ProviderError::Exit {
                    code: Some(2),
                    stderr: "Please log in first".to_string(),
                });
            }
            Ok(format!("echo: {}", prompt))
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    fn request(message: &str) -> TurnRequest {
        let mut req = TurnRequest::from_settings(&Settings::default(), PathBuf::from("/ws"), message);
        req.ability_profile = Some("builder".to_string());
        req
    }

    #[tokio::test]
    async fn success_includes_profile_and_workspace() {
        let adapter = ProviderTurnAdapter::new(Arc::new(EchoProvider), &Settings::default());
        let out = adapter.run_turn(request("do thing"), CancellationToken::new()).await;
        assert!(out.ok);
        assert!(out.response.contains("Ability profile: builder"));
        assert!(out.response.contains("Workspace: /ws"));
        assert!(out.response.ends_with("do thing"));
        assert!(out.memory_path.is_none());
    }

    #[tokio::test]
    async fn failure_is_classified_with_exit_code() {
        let adapter = ProviderTurnAdapter::new(Arc::new(EchoProvider), &Settings::default());
        let out = adapter.run_turn(request("fail please"), CancellationToken::new()).await;
        assert!(!out.ok);
        assert_eq!(out.exit_code, Some(2));
        assert!(out.error_message.unwrap().starts_with("[unauthorized]"));
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let adapter = ProviderTurnAdapter::new(Arc::new(EchoProvider), &Settings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = adapter.run_turn(request("hang"), cancel).await;
        assert!(!out.ok);
        assert!(out.error_message.unwrap().starts_with("[cancelled]"));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let adapter = ProviderTurnAdapter::new(Arc::new(EchoProvider), &Settings::default())
            .with_timeout(Duration::from_millis(50));
        let out = adapter.run_turn(request("hang"), CancellationToken::new()).await;
        assert!(!out.ok);
        assert!(out.error_message.unwrap().starts_with("[timeout]"));
    }

    #[tokio::test]
    async fn transcript_is_appended_per_turn() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let adapter =
            ProviderTurnAdapter::new(Arc::new(EchoProvider), &Settings::default()).with_memory(&paths);
        let first = adapter.run_turn(request("one"), CancellationToken::new()).await;
        adapter.run_turn(request("two"), CancellationToken::new()).await;

        let path = first.memory_path.unwrap();
        let lines = std::fs::read_to_string(path).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn context_guard_trims_middle_of_long_messages() {
        let guard = ContextGuard {
            enabled: true,
            threshold_pct: 50,
            max_prompt_chars: 400,
        };
        let message = format!("{}{}{}", "H".repeat(300), "M".repeat(300), "T".repeat(300));
        let out = guard_message(&message, &guard, true, 50);
        assert!(out.chars().count() <= 200);
        assert!(out.starts_with('H'));
        assert!(out.ends_with('T'));
        assert!(out.contains("trimmed by context guard"));

        assert_eq!(guard_message(&message, &guard, false, 50), message);
        assert_eq!(guard_message("short", &guard, true, 50), "short");
    }

    #[test]
    fn context_guard_never_exceeds_a_tiny_budget() {
        let guard = ContextGuard {
            enabled: true,
            threshold_pct: 100,
            max_prompt_chars: 20,
        };
        let message = "x".repeat(500);
        let out = guard_message(&message, &guard, true, 100);
        assert_eq!(out, "x".repeat(20));

        let out = guard_message(&message, &guard, true, 10);
        assert_eq!(out.chars().count(), 2);
    }

    #[test]
    fn provider_errors_map_to_failure_codes() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(classify_error(&ProviderError::IoError(missing)), FailureCode::CliMissing);
        assert_eq!(classify_error(&ProviderError::Timeout), FailureCode::Timeout);
        assert_eq!(classify_error(&ProviderError::Cancelled), FailureCode::Cancelled);

        let denied = ProviderError::Exit {
            code: Some(1),
            stderr: "Please log in first".to_string(),
        };
        assert_eq!(classify_error(&denied), FailureCode::Unauthorized);
        let refused = ProviderError::Exit {
            code: Some(1),
            stderr: "connection refused".to_string(),
        };
        assert_eq!(classify_error(&refused), FailureCode::ProviderUnavailable);
        let odd = ProviderError::Exit {
            code: Some(2),
            stderr: "segfault".to_string(),
        };
        assert_eq!(classify_error(&odd), FailureCode::Unknown);
    }
}
