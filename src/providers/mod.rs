//! AI Providers module.

use std::sync::Arc;

pub mod claude;
pub mod codex;
pub mod provider;

pub use provider::{Provider, ProviderError, Result};

use crate::config::Settings;

/// Provider factory. Unknown names fall back to claude.
pub fn create_provider(name: &str, cli_path: Option<&str>) -> Arc<dyn Provider> {
    match (name, cli_path) {
        ("codex", Some(path)) => Arc::new(codex::CodexProvider::with_cli_path(path)),
        ("codex", None) => Arc::new(codex::CodexProvider::new()),
        (other, path) => {
            if other != "claude" {
                tracing::warn!("Unknown provider '{}', falling back to claude", other);
            }
            match path {
                Some(path) => Arc::new(claude::ClaudeProvider::with_cli_path(path)),
                None => Arc::new(claude::ClaudeProvider::new()),
            }
        }
    }
}

/// Get the current provider from settings.
pub fn get_current_provider(settings: &Settings) -> Arc<dyn Provider> {
    create_provider(&settings.models.provider, settings.models.cli_path.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_selects_by_name() {
        assert_eq!(create_provider("codex", None).name(), "codex");
        assert_eq!(create_provider("claude", None).name(), "claude");
        assert_eq!(create_provider("mystery", None).name(), "claude");
    }
}
