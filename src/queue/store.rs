//! Durable per-workspace FIFO task store.
//!
//! Layout: `<home>/queue/<workspace-hash>.json`, one file per resolved
//! workspace. Each write replaces the whole file via temp file + rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::write_json_atomic;
use crate::error::Error;
use crate::workspace;

use super::task::{QueueSummary, QueueTask, StatusUpdate, TaskStatus, WorkspaceQueueState};

/// Persistence behind [`TaskQueue`].
pub trait QueueBackend: Send + Sync {
    /// Load the state for a resolved workspace. Missing or unreadable
    /// storage yields an empty state.
    fn load(&self, workspace: &Path) -> WorkspaceQueueState;

    /// Fully replace the stored state.
    fn save(&self, state: &WorkspaceQueueState) -> Result<(), Error>;

    /// Human-readable location of a workspace's storage.
    fn location(&self, workspace: &Path) -> String;
}

/// JSON-file backend.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, workspace: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", workspace::hash(workspace)))
    }
}

impl QueueBackend for FileBackend {
    fn load(&self, workspace: &Path) -> WorkspaceQueueState {
        let path = self.file_for(workspace);
        if !path.exists() {
            return WorkspaceQueueState::empty(workspace);
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Unreadable queue file {}: {}", path.display(), e);
                return WorkspaceQueueState::empty(workspace);
            }
        };

        match serde_json::from_str::<WorkspaceQueueState>(&content) {
            Ok(mut state) => {
                state.workspace = workspace.to_path_buf();
                state
            }
            Err(e) => {
                tracing::warn!("Corrupt queue file {}, treating as empty: {}", path.display(), e);
                WorkspaceQueueState::empty(workspace)
            }
        }
    }

    fn save(&self, state: &WorkspaceQueueState) -> Result<(), Error> {
        let path = self.file_for(&state.workspace);
        write_json_atomic(&path, state)?;
        tracing::debug!("Saved {} queue tasks to {}", state.tasks.len(), path.display());
        Ok(())
    }

    fn location(&self, workspace: &Path) -> String {
        self.file_for(workspace).display().to_string()
    }
}

/// FIFO task queue operations over a [`QueueBackend`].
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    // Serializes read-modify-write cycles within this process.
    write_lock: Arc<Mutex<()>>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// File-backed queue under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    pub fn location(&self, workspace: &Path) -> String {
        self.backend.location(&workspace::resolve(workspace))
    }

    fn mutate<T>(
        &self,
        workspace: &Path,
        f: impl FnOnce(&mut WorkspaceQueueState) -> Option<T>,
    ) -> Result<Option<T>, Error> {
        let resolved = workspace::resolve(workspace);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.backend.load(&resolved);
        let out = f(&mut state);
        if out.is_some() {
            state.updated_at = Utc::now();
            self.backend.save(&state)?;
        }
        Ok(out)
    }

    /// Append a pending task to the end of the workspace's queue.
    pub fn add(&self, workspace: &Path, title: &str, prompt: &str) -> Result<QueueTask, Error> {
        let title = title.trim();
        let prompt = prompt.trim();
        if title.is_empty() {
            return Err(Error::Validation("task title must not be empty".to_string()));
        }
        if prompt.is_empty() {
            return Err(Error::Validation("task prompt must not be empty".to_string()));
        }

        let resolved = workspace::resolve(workspace);
        let task = QueueTask::new(&resolved, title, prompt);
        let created = self.mutate(&resolved, |state| {
            state.tasks.push(task.clone());
            Some(task)
        })?;

        let task = created.ok_or_else(|| Error::Queue("task was not stored".to_string()))?;
        tracing::debug!("Queued task {} for {}", task.id, resolved.display());
        Ok(task)
    }

    /// All tasks in insertion order.
    pub fn list(&self, workspace: &Path) -> Vec<QueueTask> {
        self.backend.load(&workspace::resolve(workspace)).tasks
    }

    /// The earliest-added task still pending.
    pub fn find_next_pending(&self, workspace: &Path) -> Option<QueueTask> {
        self.list(workspace)
            .into_iter()
            .find(|t| t.status == TaskStatus::Pending)
    }

    pub fn get(&self, workspace: &Path, task_id: &str) -> Option<QueueTask> {
        self.list(workspace).into_iter().find(|t| t.id == task_id)
    }

    /// Apply a status transition. Returns `None` when the task no longer exists.
    pub fn update_status(
        &self,
        workspace: &Path,
        task_id: &str,
        update: StatusUpdate,
    ) -> Result<Option<QueueTask>, Error> {
        self.mutate(workspace, |state| {
            let task = state.tasks.iter_mut().find(|t| t.id == task_id)?;
            update.apply(task);
            Some(task.clone())
        })
    }

    /// Remove one task. Returns whether it existed.
    pub fn remove(&self, workspace: &Path, task_id: &str) -> Result<bool, Error> {
        let removed = self.mutate(workspace, |state| {
            let before = state.tasks.len();
            state.tasks.retain(|t| t.id != task_id);
            (state.tasks.len() < before).then_some(())
        })?;
        Ok(removed.is_some())
    }

    /// Remove every task. Returns the number removed.
    pub fn clear(&self, workspace: &Path) -> Result<usize, Error> {
        let removed = self.mutate(workspace, |state| {
            let count = state.tasks.len();
            state.tasks.clear();
            Some(count)
        })?;
        Ok(removed.unwrap_or(0))
    }

    pub fn summary(&self, workspace: &Path) -> QueueSummary {
        QueueSummary::from_tasks(&self.list(workspace))
    }
}
