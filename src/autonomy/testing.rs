//! Fake turn adapters and lock owners for scheduler tests.

use async_trait::async_trait;
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::turn::{TurnAdapter, TurnOutcome, TurnRequest};

use super::lock::{write_lock, RuntimeLock};
use super::state::AutonomyMode;

/// Answers immediately; fails when the prompt contains `fail_marker`.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    calls: Mutex<Vec<String>>,
    fail_marker: Option<String>,
}

impl ScriptedAdapter {
    pub(crate) fn failing_on(marker: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_marker: Some(marker.to_string()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnAdapter for ScriptedAdapter {
    async fn run_turn(&self, request: TurnRequest, _cancel: CancellationToken) -> TurnOutcome {
        self.calls.lock().unwrap().push(request.user_message.clone());
        match &self.fail_marker {
            Some(marker) if request.user_message.contains(marker.as_str()) => {
                TurnOutcome::failure(format!("adapter failed on {}", request.user_message))
            }
            _ => TurnOutcome::success(format!("done: {}", request.user_message)),
        }
    }
}

/// Blocks until released or cancelled.
#[derive(Default)]
pub(crate) struct BlockingAdapter {
    pub(crate) entered: Notify,
    pub(crate) release: Notify,
}

#[async_trait]
impl TurnAdapter for BlockingAdapter {
    async fn run_turn(&self, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome {
        self.entered.notify_one();
        tokio::select! {
            _ = self.release.notified() => TurnOutcome::success(format!("released: {}", request.user_message)),
            _ = cancel.cancelled() => TurnOutcome::failure("[cancelled] turn aborted"),
        }
    }
}

/// A separate live process that can be named as the owner of a run lock.
pub(crate) struct ForeignOwner {
    child: Option<Child>,
    pid: u32,
}

impl ForeignOwner {
    pub(crate) fn spawn() -> Self {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Write a run lock at `path` naming this process as owner.
    pub(crate) fn claim(&self, path: &Path, workspace: &Path) {
        let mut lock = RuntimeLock::for_current_process(
            AutonomyMode::Queued,
            workspace,
            5,
            30,
            chrono::Utc::now(),
        );
        lock.pid = self.pid;
        write_lock(path, &lock).unwrap();
    }

    /// Reap the process on a background thread so its exit is observable.
    pub(crate) fn reap_in_background(mut self) -> JoinHandle<ExitStatus> {
        let mut child = self.child.take().unwrap();
        std::thread::spawn(move || child.wait().unwrap())
    }
}

impl Drop for ForeignOwner {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
