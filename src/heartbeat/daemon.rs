//! Heartbeat daemon: advances the task queue by at most one task per tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::autonomy::{AutonomyMode, AutonomyRuntime, RunResult};
use crate::config::{self, Paths, Settings};
use crate::error::Error;

use super::status::{runtime_label, write_status, HeartbeatStatus};

/// Why a tick did not try to execute anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleReason {
    HeartbeatDisabled,
    AutonomyDisabled,
    FreeRunMode,
    RunActive,
}

impl std::fmt::Display for IdleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleReason::HeartbeatDisabled => write!(f, "heartbeat disabled"),
            IdleReason::AutonomyDisabled => write!(f, "autonomy disabled"),
            IdleReason::FreeRunMode => write!(f, "autonomy is in free-run mode"),
            IdleReason::RunActive => write!(f, "an autonomy run is active"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickSkip {
    InFlight,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Skipped(TickSkip),
    Idle { reason: IdleReason },
    Ran(RunResult),
    Failed(String),
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickOutcome::Skipped(TickSkip::InFlight) => write!(f, "heartbeat tick already in flight"),
            TickOutcome::Idle { reason } => write!(f, "idle: {}", reason),
            TickOutcome::Ran(result) => write!(f, "{}", result.summary()),
            TickOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    runtime: AutonomyRuntime,
    interval: Duration,
    tick_in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
    running: Mutex<Option<Running>>,
}

/// Periodic queue trigger. Clones share the same loop.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<Inner>,
}

impl Heartbeat {
    pub fn new(runtime: AutonomyRuntime, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                interval,
                tick_in_flight: AtomicBool::new(false),
                last_error: Mutex::new(None),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn runtime(&self) -> &AutonomyRuntime {
        &self.inner.runtime
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Spawn the interval loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let heartbeat = self.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { heartbeat.run_loop(token).await });
        *running = Some(Running { shutdown, handle });

        tracing::info!("Heartbeat started (interval {}s)", self.inner.interval.as_secs());
        true
    }

    /// Cancel the loop and wait for any in-progress tick to finish.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Running { shutdown, handle }) = running else {
            return;
        };

        shutdown.cancel();
        if let Err(e) = handle.await {
            tracing::warn!("Heartbeat loop ended abnormally: {}", e);
        }
        tracing::info!("Heartbeat stopped");
    }

    async fn run_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = self.tick_with(&shutdown).await;
            tracing::debug!("Heartbeat tick: {}", outcome);
        }
    }

    /// Run one tick now.
    pub async fn tick(&self) -> TickOutcome {
        self.tick_with(&CancellationToken::new()).await
    }

    async fn tick_with(&self, cancel: &CancellationToken) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.inner.tick_in_flight) else {
            tracing::debug!("Heartbeat tick already in flight");
            return TickOutcome::Skipped(TickSkip::InFlight);
        };

        let runtime = &self.inner.runtime;
        let settings = config::load_settings_or_default(runtime.paths());
        runtime.update_settings(settings.clone());

        let outcome = match idle_reason(&settings, runtime.run_active()) {
            Some(reason) => TickOutcome::Idle { reason },
            None => {
                let workspace = settings.default_workspace();
                match runtime.run_next_queued_task_with(&workspace, cancel).await {
                    Ok(result) => TickOutcome::Ran(result),
                    Err(e) => TickOutcome::Failed(e.to_string()),
                }
            }
        };

        self.record(&outcome);
        self.persist(&settings);
        outcome
    }

    fn record(&self, outcome: &TickOutcome) {
        let mut last_error = self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            TickOutcome::Ran(RunResult::Completed { .. }) => *last_error = None,
            TickOutcome::Ran(RunResult::Failed { reason, .. }) => {
                tracing::warn!("Heartbeat task failed: {}", reason);
                *last_error = Some(reason.clone());
            }
            TickOutcome::Failed(message) => {
                tracing::error!("Heartbeat tick failed: {}", message);
                *last_error = Some(message.clone());
            }
            _ => {}
        }
    }

    fn persist(&self, settings: &Settings) {
        let status = HeartbeatStatus {
            enabled: settings.heartbeat.enabled,
            last_tick_at: Some(Utc::now()),
            runtime: runtime_label(),
            autonomy_enabled: settings.autonomy.enabled,
            active_run: self.inner.runtime.run_active(),
            last_error: self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        };
        let path = self.inner.runtime.paths().heartbeat_state_file();
        if let Err(e) = write_status(&path, &status) {
            tracing::warn!("Failed to persist heartbeat state: {}", e);
        }
    }
}

fn idle_reason(settings: &Settings, run_active: bool) -> Option<IdleReason> {
    if !settings.heartbeat.enabled {
        Some(IdleReason::HeartbeatDisabled)
    } else if !settings.autonomy.enabled {
        Some(IdleReason::AutonomyDisabled)
    } else if settings.autonomy.mode != AutonomyMode::Queued {
        Some(IdleReason::FreeRunMode)
    } else if run_active {
        Some(IdleReason::RunActive)
    } else {
        None
    }
}

/// Run the heartbeat in the foreground until Ctrl+C.
pub async fn run_heartbeat_daemon(paths: Paths) -> Result<(), Error> {
    tracing::info!("Starting heartbeat daemon...");

    let settings = config::load_settings(&paths)?;
    let interval = Duration::from_secs(settings.heartbeat.interval_secs);
    let heartbeat = Heartbeat::new(AutonomyRuntime::from_settings(settings, paths), interval);
    heartbeat.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, stopping heartbeat");
    heartbeat.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::testing::{BlockingAdapter, ScriptedAdapter};
    use crate::autonomy::{RunRequest, SkipReason};
    use crate::heartbeat::read_status;
    use crate::queue::{TaskQueue, TaskStatus};
    use crate::turn::TurnAdapter;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        workspace: PathBuf,
        paths: Paths,
        heartbeat: Heartbeat,
    }

    fn harness(adapter: Arc<dyn TurnAdapter>, enabled: bool, mode: AutonomyMode) -> Harness {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("ws");
        let paths = Paths::new(dir.path().join("home"));

        let mut settings = Settings::default();
        settings.workspace.path = Some(workspace.clone());
        settings.autonomy.enabled = enabled;
        settings.autonomy.mode = mode;
        config::save_settings(&paths, &settings).unwrap();

        let runtime = AutonomyRuntime::new(
            TaskQueue::open(paths.queue_dir()),
            adapter,
            settings,
            paths.clone(),
        );
        Harness {
            _dir: dir,
            workspace,
            paths,
            heartbeat: Heartbeat::new(runtime, Duration::from_secs(3600)),
        }
    }

    fn statuses(h: &Harness) -> Vec<TaskStatus> {
        let queue = h.heartbeat.runtime().queue();
        queue.list(&h.workspace).into_iter().map(|t| t.status).collect()
    }

    #[tokio::test]
    async fn idle_when_autonomy_disabled() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let h = harness(adapter.clone(), false, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "p").unwrap();

        let outcome = h.heartbeat.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Idle {
                reason: IdleReason::AutonomyDisabled
            }
        );
        assert!(adapter.calls().is_empty());

        let status = read_status(&h.paths.heartbeat_state_file()).unwrap();
        assert!(status.enabled);
        assert!(!status.autonomy_enabled);
        assert!(!status.active_run);
        assert!(status.last_tick_at.is_some());
    }

    #[tokio::test]
    async fn idle_in_free_run_mode() {
        let h = harness(Arc::new(ScriptedAdapter::default()), true, AutonomyMode::FreeRun);
        assert_eq!(
            h.heartbeat.tick().await,
            TickOutcome::Idle {
                reason: IdleReason::FreeRunMode
            }
        );
    }

    #[tokio::test]
    async fn each_tick_runs_exactly_one_task() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let h = harness(adapter.clone(), true, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "one").unwrap();
        h.heartbeat.runtime().queue().add(&h.workspace, "b", "two").unwrap();

        let outcome = h.heartbeat.tick().await;
        assert!(matches!(outcome, TickOutcome::Ran(RunResult::Completed { .. })));
        assert_eq!(statuses(&h), vec![TaskStatus::Completed, TaskStatus::Pending]);

        h.heartbeat.tick().await;
        let outcome = h.heartbeat.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Ran(RunResult::skipped(SkipReason::NoPendingTasks))
        );
        assert_eq!(adapter.calls(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn task_failure_is_recorded_and_ticks_continue() {
        let h = harness(Arc::new(ScriptedAdapter::failing_on("bad")), true, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "bad").unwrap();
        h.heartbeat.runtime().queue().add(&h.workspace, "b", "good").unwrap();

        h.heartbeat.tick().await;
        let status = read_status(&h.paths.heartbeat_state_file()).unwrap();
        assert_eq!(status.last_error.as_deref(), Some("adapter failed on bad"));

        let outcome = h.heartbeat.tick().await;
        assert!(matches!(outcome, TickOutcome::Ran(RunResult::Completed { .. })));
        let status = read_status(&h.paths.heartbeat_state_file()).unwrap();
        assert!(status.last_error.is_none());
        assert_eq!(statuses(&h), vec![TaskStatus::Failed, TaskStatus::Completed]);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let adapter = Arc::new(BlockingAdapter::default());
        let h = harness(adapter.clone(), true, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "p").unwrap();

        let hb = h.heartbeat.clone();
        let first = tokio::spawn(async move { hb.tick().await });
        adapter.entered.notified().await;

        assert_eq!(h.heartbeat.tick().await, TickOutcome::Skipped(TickSkip::InFlight));

        adapter.release.notify_one();
        assert!(matches!(
            first.await.unwrap(),
            TickOutcome::Ran(RunResult::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn idle_while_a_run_is_active() {
        let adapter = Arc::new(BlockingAdapter::default());
        let h = harness(adapter.clone(), true, AutonomyMode::Queued);
        let runtime = h.heartbeat.runtime();
        runtime.queue().add(&h.workspace, "a", "p").unwrap();

        runtime
            .start_run(RunRequest {
                mode: AutonomyMode::Queued,
                workspace: h.workspace.clone(),
                max_turns: 1,
                max_minutes: 5,
            })
            .unwrap();
        adapter.entered.notified().await;

        assert_eq!(
            h.heartbeat.tick().await,
            TickOutcome::Idle {
                reason: IdleReason::RunActive
            }
        );
        assert!(read_status(&h.paths.heartbeat_state_file()).unwrap().active_run);

        runtime.stop_run().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_while_another_process_holds_the_run_lock() {
        let adapter = Arc::new(ScriptedAdapter::default());
        let h = harness(adapter.clone(), true, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "p").unwrap();

        let owner = crate::autonomy::testing::ForeignOwner::spawn();
        owner.claim(&h.paths.runtime_lock_file(), &h.workspace);

        assert_eq!(
            h.heartbeat.tick().await,
            TickOutcome::Idle {
                reason: IdleReason::RunActive
            }
        );
        assert!(adapter.calls().is_empty());
        assert_eq!(statuses(&h), vec![TaskStatus::Pending]);
        assert!(read_status(&h.paths.heartbeat_state_file()).unwrap().active_run);
    }

    #[tokio::test]
    async fn stop_cancels_and_waits_for_in_progress_tick() {
        let adapter = Arc::new(BlockingAdapter::default());
        let h = harness(adapter.clone(), true, AutonomyMode::Queued);
        h.heartbeat.runtime().queue().add(&h.workspace, "a", "p").unwrap();

        assert!(h.heartbeat.start());
        assert!(!h.heartbeat.start());
        adapter.entered.notified().await;

        h.heartbeat.stop().await;
        assert!(!h.heartbeat.is_running());
        assert_eq!(statuses(&h), vec![TaskStatus::Failed]);
        assert!(h.heartbeat.runtime().state().active_task_id.is_none());
    }
}
