//! Runtime lock record.
//!
//! Written while a run is active. In-process exclusion goes through the run
//! slot; a live record owned by another process blocks runs started here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::write_json_atomic;
use crate::error::Error;

use super::state::AutonomyMode;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLock {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub mode: AutonomyMode,
    pub workspace: PathBuf,
    pub max_turns: u32,
    pub max_minutes: u64,
}

impl RuntimeLock {
    pub fn for_current_process(
        mode: AutonomyMode,
        workspace: &Path,
        max_turns: u32,
        max_minutes: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            started_at,
            mode,
            workspace: workspace.to_path_buf(),
            max_turns,
            max_minutes,
        }
    }

    pub fn held_by_this_process(&self) -> bool {
        self.pid == std::process::id()
    }

    /// A lock is stale when its owner is gone, or when it names this
    /// process but no run is active here.
    pub fn is_stale(&self, running_here: bool) -> bool {
        if self.held_by_this_process() {
            return !running_here;
        }
        !is_pid_alive(self.pid)
    }
}

fn is_pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn write_lock(path: &Path, lock: &RuntimeLock) -> Result<(), Error> {
    write_json_atomic(path, lock)?;
    tracing::debug!("Wrote runtime lock: {}", path.display());
    Ok(())
}

/// Read the lock record, if present and parseable.
pub fn read_lock(path: &Path) -> Option<RuntimeLock> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(lock) => Some(lock),
        Err(e) => {
            tracing::warn!("Ignoring unreadable runtime lock {}: {}", path.display(), e);
            None
        }
    }
}

/// The lock record of a live run owned by another process, if any.
pub fn foreign_run(path: &Path) -> Option<RuntimeLock> {
    read_lock(path).filter(|lock| !lock.held_by_this_process() && !lock.is_stale(false))
}

/// Remove the lock record. Returns whether a file was removed.
pub fn remove_lock(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Released runtime lock: {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!("Failed to release runtime lock {}: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("autonomy").join("runtime.lock.json");
        let lock = RuntimeLock::for_current_process(
            AutonomyMode::FreeRun,
            Path::new("/ws"),
            3,
            10,
            Utc::now(),
        );

        write_lock(&path, &lock).unwrap();
        let read = read_lock(&path).unwrap();
        assert_eq!(read, lock);
        assert!(read.held_by_this_process());

        assert!(remove_lock(&path));
        assert!(!remove_lock(&path));
        assert!(read_lock(&path).is_none());
    }

    #[test]
    fn staleness_follows_owner() {
        let mut lock =
            RuntimeLock::for_current_process(AutonomyMode::Queued, Path::new("/ws"), 1, 1, Utc::now());
        assert!(lock.is_stale(false));
        assert!(!lock.is_stale(true));

        lock.pid = u32::MAX - 1;
        assert!(lock.is_stale(false));
    }

    #[cfg(unix)]
    #[test]
    fn foreign_run_requires_a_live_other_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime.lock.json");
        assert!(foreign_run(&path).is_none());

        let mut lock =
            RuntimeLock::for_current_process(AutonomyMode::Queued, Path::new("/ws"), 1, 1, Utc::now());
        write_lock(&path, &lock).unwrap();
        assert!(foreign_run(&path).is_none());

        let owner = crate::autonomy::testing::ForeignOwner::spawn();
        lock.pid = owner.pid();
        write_lock(&path, &lock).unwrap();
        assert_eq!(foreign_run(&path).map(|l| l.pid), Some(owner.pid()));

        lock.pid = u32::MAX - 1;
        write_lock(&path, &lock).unwrap();
        assert!(foreign_run(&path).is_none());
    }

    #[test]
    fn garbage_lock_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime.lock.json");
        std::fs::write(&path, "pid=12").unwrap();
        assert!(read_lock(&path).is_none());
    }
}
