//! Persisted heartbeat liveness record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::write_json_atomic;
use crate::error::Error;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub enabled: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Name and version of the process that wrote the record.
    pub runtime: String,
    pub autonomy_enabled: bool,
    pub active_run: bool,
    pub last_error: Option<String>,
}

pub fn runtime_label() -> String {
    format!("agentloop {}", env!("CARGO_PKG_VERSION"))
}

pub fn write_status(path: &Path, status: &HeartbeatStatus) -> Result<(), Error> {
    write_json_atomic(path, status)
}

/// Last persisted status, if any.
pub fn read_status(path: &Path) -> Option<HeartbeatStatus> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content)
        .map_err(|e| tracing::warn!("Ignoring unreadable heartbeat state {}: {}", path.display(), e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn status_uses_camel_case_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat").join("state.json");
        let status = HeartbeatStatus {
            enabled: true,
            last_tick_at: Some(Utc::now()),
            runtime: runtime_label(),
            autonomy_enabled: true,
            active_run: false,
            last_error: Some("boom".to_string()),
        };
        write_status(&path, &status).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["autonomyEnabled"], true);
        assert_eq!(raw["lastError"], "boom");
        assert_eq!(read_status(&path), Some(status));
    }

    #[test]
    fn missing_or_corrupt_status_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(read_status(&path).is_none());
        std::fs::write(&path, "[").unwrap();
        assert!(read_status(&path).is_none());
    }
}
