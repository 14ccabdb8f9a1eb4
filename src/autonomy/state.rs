//! Autonomy runtime state and result shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Run mode, fixed for the duration of a run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyMode {
    /// Only execute user-added tasks.
    #[default]
    Queued,
    /// Synthesize one task per turn.
    FreeRun,
}

impl std::fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutonomyMode::Queued => write!(f, "queued"),
            AutonomyMode::FreeRun => write!(f, "free-run"),
        }
    }
}

impl FromStr for AutonomyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" | "queue" => Ok(AutonomyMode::Queued),
            "free-run" | "free_run" | "freerun" => Ok(AutonomyMode::FreeRun),
            _ => Err(format!("Unknown autonomy mode: {}", s)),
        }
    }
}

/// Process-local run descriptor. Snapshots are handed out by value.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutonomyRuntimeState {
    pub running: bool,
    pub mode: Option<AutonomyMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub workspace: Option<PathBuf>,
    pub turns_completed: u32,
    pub max_turns: u32,
    pub max_minutes: u64,
    pub stop_requested: bool,
    pub active_task_id: Option<String>,
}

/// Parameters for a timed run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub mode: AutonomyMode,
    pub workspace: PathBuf,
    pub max_turns: u32,
    pub max_minutes: u64,
}

/// Why a single step did not execute anything.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoPendingTasks,
    StepInFlight,
    RunActive,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoPendingTasks => write!(f, "no pending tasks"),
            SkipReason::StepInFlight => write!(f, "a queued task is already executing"),
            SkipReason::RunActive => write!(f, "an autonomy run is active"),
        }
    }
}

/// Outcome of one `run_next_queued_task` call.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RunResult {
    Skipped {
        reason: SkipReason,
    },
    Completed {
        #[serde(rename = "taskId")]
        task_id: String,
        title: String,
        response: String,
    },
    Failed {
        #[serde(rename = "taskId")]
        task_id: String,
        title: String,
        reason: String,
    },
}

impl RunResult {
    pub fn skipped(reason: SkipReason) -> Self {
        RunResult::Skipped { reason }
    }

    /// True when a task was claimed and executed.
    pub fn ran(&self) -> bool {
        !matches!(self, RunResult::Skipped { .. })
    }

    pub fn ok(&self) -> bool {
        matches!(self, RunResult::Completed { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            RunResult::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            RunResult::Completed { task_id, .. } | RunResult::Failed { task_id, .. } => Some(task_id),
            RunResult::Skipped { .. } => None,
        }
    }

    /// One-line summary for CLI output.
    pub fn summary(&self) -> String {
        match self {
            RunResult::Skipped { reason } => format!("Nothing ran: {}", reason),
            RunResult::Completed { task_id, title, response } => format!(
                "Completed {} ({}): {}",
                task_id,
                title,
                first_line(response)
            ),
            RunResult::Failed { task_id, title, reason } => {
                format!("Failed {} ({}): {}", task_id, title, first_line(reason))
            }
        }
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() > 120 {
        format!("{}...", line.chars().take(120).collect::<String>())
    } else {
        line.to_string()
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartRejection {
    AlreadyRunning,
}

impl std::fmt::Display for StartRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartRejection::AlreadyRunning => write!(f, "an autonomy run is already active"),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct StartOutcome {
    pub started: bool,
    pub reason: Option<StartRejection>,
    pub state: AutonomyRuntimeState,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StopRejection {
    NotRunning,
}

impl std::fmt::Display for StopRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopRejection::NotRunning => write!(f, "no autonomy run is active"),
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct StopOutcome {
    pub stopped: bool,
    pub reason: Option<StopRejection>,
    pub state: AutonomyRuntimeState,
}
