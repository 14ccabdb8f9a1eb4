//! Configuration loading for agentloop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::autonomy::AutonomyMode;
use crate::error::Error;
use crate::policy::AccessPolicy;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "AGENTLOOP_HOME";

/// On-disk layout rooted at the agentloop home directory.
#[derive(Clone, Debug)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `$AGENTLOOP_HOME`, or `~/.agentloop`.
    pub fn from_env() -> Result<Self> {
        if let Ok(raw) = std::env::var(HOME_ENV) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Ok(Self::new(trimmed));
            }
        }
        let home = directories::UserDirs::new()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Ok(Self::new(home.home_dir().join(".agentloop")))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join("settings.json")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.home.join("queue")
    }

    pub fn runtime_lock_file(&self) -> PathBuf {
        self.home.join("autonomy").join("runtime.lock.json")
    }

    pub fn heartbeat_state_file(&self) -> PathBuf {
        self.home.join("heartbeat").join("state.json")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.home.join("memory")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
}

/// Load settings from `<home>/settings.json`.
///
/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings(paths: &Paths) -> Result<Settings> {
    let path = paths.settings_file();
    if !path.exists() {
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if unreadable.
pub fn load_settings_or_default(paths: &Paths) -> Settings {
    load_settings(paths).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn save_settings(paths: &Paths, settings: &Settings) -> Result<()> {
    write_json_atomic(&paths.settings_file(), settings)
}

/// Record queue metadata after a task run. This is the only settings write
/// the autonomy core performs.
pub fn record_queue_run(paths: &Paths, workspace_hash: &str, at: DateTime<Utc>) -> Result<()> {
    let mut settings = load_settings(paths)?;
    settings.queue.default_workspace_hash = Some(workspace_hash.to_string());
    settings.queue.last_run_at = Some(at);
    save_settings(paths, &settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.context_guard.threshold_pct == 0 || settings.context_guard.threshold_pct > 100 {
        return Err(Error::Config(format!(
            "context_guard.threshold_pct must be within 1..=100, got {}",
            settings.context_guard.threshold_pct
        )));
    }
    if settings.heartbeat.interval_secs == 0 {
        return Err(Error::Config("heartbeat.interval_secs must be positive".to_string()));
    }
    Ok(())
}

/// Serialize `value` and replace `path` in one rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');

    // Unique temp name so concurrent writers never share a temp file.
    let tmp_path = path.with_extension(format!("{}.tmp", ulid::Ulid::new()));
    std::fs::write(&tmp_path, buf)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Workspace configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Workspace {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
}

/// Models configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Models {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    /// Override for the provider binary.
    pub cli_path: Option<String>,
}

fn default_provider() -> String {
    "claude".to_string()
}

impl Default for Models {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            cli_path: None,
        }
    }
}

/// Context guard configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContextGuard {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: u8,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

fn default_true() -> bool {
    true
}

fn default_threshold_pct() -> u8 {
    80
}

fn default_max_prompt_chars() -> usize {
    120_000
}

impl Default for ContextGuard {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_pct: default_threshold_pct(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

/// Autonomy configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Autonomy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AutonomyMode,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_minutes")]
    pub max_minutes: u64,
}

fn default_max_turns() -> u32 {
    5
}

fn default_max_minutes() -> u64 {
    30
}

impl Default for Autonomy {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AutonomyMode::default(),
            max_turns: default_max_turns(),
            max_minutes: default_max_minutes(),
        }
    }
}

/// Heartbeat configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    300
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Queue metadata written back after each run.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct QueueMeta {
    pub default_workspace_hash: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Model turn configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TurnConfig {
    #[serde(default = "default_turn_timeout")]
    pub timeout_secs: u64,
}

fn default_turn_timeout() -> u64 {
    900
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_turn_timeout(),
        }
    }
}

/// agentloop settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub workspace: Workspace,

    #[serde(default)]
    pub access: AccessPolicy,

    #[serde(default)]
    pub models: Models,

    #[serde(default)]
    pub ability_profile: Option<String>,

    #[serde(default)]
    pub context_guard: ContextGuard,

    #[serde(default)]
    pub autonomy: Autonomy,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub queue: QueueMeta,

    #[serde(default)]
    pub turn: TurnConfig,
}

impl Settings {
    /// The configured default workspace, or the current directory.
    pub fn default_workspace(&self) -> PathBuf {
        let raw = self
            .workspace
            .path
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        crate::workspace::resolve(&raw)
    }
}
