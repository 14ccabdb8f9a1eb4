//! Queue task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Task status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One unit of autonomous work for a workspace.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    /// Unique ID (ULID)
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub workspace: PathBuf,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_result: Option<String>,
}

impl QueueTask {
    /// Create a pending task. Callers validate and trim title/prompt.
    pub fn new(workspace: &Path, title: &str, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            title: title.to_string(),
            prompt: prompt.to_string(),
            workspace: workspace.to_path_buf(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            last_error: None,
            last_result: None,
        }
    }
}

/// A status transition plus the optional fields to overwrite with it.
///
/// `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub last_error: Option<Option<String>>,
    pub last_result: Option<Option<String>>,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            last_error: None,
            last_result: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_result(mut self, result: Option<String>) -> Self {
        self.last_result = Some(result);
        self
    }

    pub(crate) fn apply(self, task: &mut QueueTask) {
        task.status = self.status;
        task.updated_at = Utc::now();
        if let Some(error) = self.last_error {
            task.last_error = error;
        }
        if let Some(result) = self.last_result {
            task.last_result = result;
        }
    }
}

/// Persisted envelope for one workspace's queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceQueueState {
    pub workspace: PathBuf,
    pub workspace_hash: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<QueueTask>,
}

impl WorkspaceQueueState {
    /// Empty state for an already-resolved workspace.
    pub fn empty(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            workspace_hash: crate::workspace::hash(workspace),
            updated_at: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

/// Per-status task counts.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueSummary {
    pub fn from_tasks(tasks: &[QueueTask]) -> Self {
        let mut summary = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

impl std::fmt::Display for QueueSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} pending={} running={} completed={} failed={} cancelled={}",
            self.total, self.pending, self.running, self.completed, self.failed, self.cancelled
        )
    }
}
