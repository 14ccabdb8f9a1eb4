//! Autonomy runtime: a single-flight scheduler over the workspace task queue.
//!
//! Two independent guards exist here:
//! - the step guard, so at most one queued task executes at a time in this
//!   process (heartbeat, CLI `run-next` and the run loop all go through it);
//! - the run slot, so at most one timed run is active.
//!
//! While a run is active, external single-step calls are rejected with
//! [`SkipReason::RunActive`]; the run loop's own steps bypass that check but
//! still take the step guard.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Autonomy, Paths, Settings};
use crate::error::Error;
use crate::policy::{assert_allowed, AccessPolicy};
use crate::providers::get_current_provider;
use crate::queue::{QueueSummary, QueueTask, StatusUpdate, TaskQueue, TaskStatus};
use crate::turn::{ProviderTurnAdapter, TurnAdapter, TurnOutcome, TurnRequest};
use crate::workspace;

use super::lock::{self, RuntimeLock};
use super::state::{
    AutonomyMode, AutonomyRuntimeState, RunRequest, RunResult, SkipReason, StartOutcome,
    StartRejection, StopOutcome, StopRejection,
};

/// Back-off while another step holds the step guard.
const STEP_RETRY_DELAY: Duration = Duration::from_millis(250);

fn free_run_prompt(workspace: &Path, turn: u32, max_turns: u32) -> String {
    format!(
        "You are working autonomously in {} (free-run turn {} of {}).\n\
         Pick ONE concrete, small and reversible improvement to this workspace and make it.\n\
         Verify the change if the project has a way to do so.\n\
         Finish with a short summary of what you changed and the next best follow-up task.",
        workspace.display(),
        turn,
        max_turns
    )
}

struct Slot {
    state: AutonomyRuntimeState,
    started: Option<Instant>,
    cancel: Option<CancellationToken>,
}

struct Inner {
    queue: TaskQueue,
    adapter: Arc<dyn TurnAdapter>,
    settings: RwLock<Settings>,
    paths: Paths,
    slot: Mutex<Slot>,
    step_in_flight: AtomicBool,
    running_tx: watch::Sender<bool>,
}

/// Clears the in-flight flag and the active task marker on every exit path.
struct StepGuard<'a> {
    inner: &'a Inner,
}

impl<'a> StepGuard<'a> {
    fn acquire(inner: &'a Inner) -> Option<Self> {
        inner
            .step_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { inner })
    }

    fn set_active(&self, task_id: &str) {
        self.inner.slot().state.active_task_id = Some(task_id.to_string());
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.inner.slot().state.active_task_id = None;
        self.inner.step_in_flight.store(false, Ordering::Release);
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn stop_requested(&self) -> bool {
        self.slot().state.stop_requested
    }

    fn check_access(&self, target: &Path) -> Result<(), Error> {
        let settings = self.settings();
        assert_allowed(target, &settings.access, &settings.default_workspace())
    }

    /// Why the active run should end now, if it should.
    fn budget_exhausted(&self, count_turns: bool) -> Option<&'static str> {
        let slot = self.slot();
        if slot.state.stop_requested {
            return Some("stop requested");
        }
        if count_turns && slot.state.turns_completed >= slot.state.max_turns {
            return Some("turn budget exhausted");
        }
        let limit = Duration::from_secs(slot.state.max_minutes.saturating_mul(60));
        if slot.started.map_or(true, |started| started.elapsed() >= limit) {
            return Some("time budget exhausted");
        }
        None
    }

    /// Claim and execute one pending task.
    ///
    /// `target` prefers a specific task (free-run executes the task it just
    /// queued); otherwise the head of the queue is taken.
    async fn step(
        &self,
        workspace: &Path,
        target: Option<&str>,
        parent: &CancellationToken,
    ) -> Result<RunResult, Error> {
        let Some(guard) = StepGuard::acquire(self) else {
            tracing::debug!("Queued task already executing; skipping step");
            return Ok(RunResult::skipped(SkipReason::StepInFlight));
        };

        let resolved = workspace::resolve(workspace);
        self.check_access(&resolved)?;

        let next = target
            .and_then(|id| self.queue.get(&resolved, id))
            .filter(|task| task.status == TaskStatus::Pending)
            .or_else(|| self.queue.find_next_pending(&resolved));
        let Some(task) = next else {
            return Ok(RunResult::skipped(SkipReason::NoPendingTasks));
        };

        guard.set_active(&task.id);
        let cancel = parent.child_token();
        Ok(self.execute(&resolved, task, cancel).await)
    }

    /// Retry a step while another caller holds the step guard.
    async fn step_when_free(
        &self,
        workspace: &Path,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, Error> {
        loop {
            let result = self.step(workspace, target, cancel).await?;
            if result.skip_reason() != Some(SkipReason::StepInFlight) || self.stop_requested() {
                return Ok(result);
            }
            tokio::select! {
                _ = tokio::time::sleep(STEP_RETRY_DELAY) => {}
                _ = cancel.cancelled() => return Ok(result),
            }
        }
    }

    async fn execute(&self, workspace: &Path, task: QueueTask, cancel: CancellationToken) -> RunResult {
        match self
            .queue
            .update_status(workspace, &task.id, StatusUpdate::new(TaskStatus::Running))
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                return RunResult::Failed {
                    task_id: task.id,
                    title: task.title,
                    reason: "task was removed before it could run".to_string(),
                }
            }
            Err(e) => return self.fail(workspace, &task, format!("failed to claim task: {}", e)),
        }
        tracing::info!("Running queued task {} ({})", task.id, task.title);

        let request = TurnRequest::from_settings(&self.settings(), workspace.to_path_buf(), &task.prompt);
        let adapter = self.adapter.clone();
        // Abort the turn if this future is dropped mid-flight.
        let _abort_on_drop = cancel.clone().drop_guard();
        let turn = tokio::spawn(async move { adapter.run_turn(request, cancel).await });
        let outcome = match turn.await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome::failure(format!("model turn crashed: {}", e)),
        };

        if outcome.ok {
            self.complete(workspace, &task, outcome.response)
        } else {
            let reason = outcome
                .error_message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "model turn failed".to_string());
            self.fail(workspace, &task, reason)
        }
    }

    fn complete(&self, workspace: &Path, task: &QueueTask, response: String) -> RunResult {
        let update = StatusUpdate::new(TaskStatus::Completed)
            .with_error(None)
            .with_result(Some(response.clone()));
        match self.queue.update_status(workspace, &task.id, update) {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!("Task {} was removed while running; result not stored", task.id),
            Err(e) => tracing::warn!("Failed to store result for task {}: {}", task.id, e),
        }

        {
            let mut slot = self.slot();
            if slot.state.running {
                slot.state.turns_completed += 1;
            }
        }

        if let Err(e) = config::record_queue_run(&self.paths, &workspace::hash(workspace), Utc::now()) {
            tracing::warn!("Failed to record queue run metadata: {}", e);
        }

        tracing::info!("Task {} completed", task.id);
        RunResult::Completed {
            task_id: task.id.clone(),
            title: task.title.clone(),
            response,
        }
    }

    fn fail(&self, workspace: &Path, task: &QueueTask, reason: String) -> RunResult {
        let update = StatusUpdate::new(TaskStatus::Failed).with_error(Some(reason.clone()));
        match self.queue.update_status(workspace, &task.id, update) {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!("Task {} was removed while running; failure not stored", task.id),
            Err(e) => tracing::error!("Failed to record failure for task {}: {}", task.id, e),
        }
        tracing::warn!("Task {} failed: {}", task.id, reason);
        RunResult::Failed {
            task_id: task.id.clone(),
            title: task.title.clone(),
            reason,
        }
    }

    fn finish_run(&self) {
        lock::remove_lock(&self.paths.runtime_lock_file());
        let mut slot = self.slot();
        slot.state.running = false;
        slot.state.mode = None;
        slot.state.stop_requested = false;
        slot.state.active_task_id = None;
        slot.started = None;
        slot.cancel = None;
        self.running_tx.send_replace(false);
    }
}

async fn run_loop(inner: Arc<Inner>, mode: AutonomyMode, workspace: PathBuf, cancel: CancellationToken) {
    let reason = match mode {
        AutonomyMode::Queued => run_queued(&inner, &workspace, &cancel).await,
        AutonomyMode::FreeRun => run_free(&inner, &workspace, &cancel).await,
    };
    let turns = inner.slot().state.turns_completed;
    tracing::info!("Autonomy run finished after {} completed turns: {}", turns, reason);
}

async fn run_queued(inner: &Inner, workspace: &Path, cancel: &CancellationToken) -> String {
    loop {
        if let Some(reason) = inner.budget_exhausted(true) {
            return reason.to_string();
        }
        match inner.step_when_free(workspace, None, cancel).await {
            Ok(RunResult::Skipped { reason }) => return reason.to_string(),
            Ok(result) => tracing::info!("{}", result.summary()),
            Err(e) => {
                tracing::warn!("Autonomy run aborted: {}", e);
                return format!("aborted: {}", e);
            }
        }
    }
}

async fn run_free(inner: &Inner, workspace: &Path, cancel: &CancellationToken) -> String {
    let max_turns = inner.slot().state.max_turns;
    for turn in 1..=max_turns {
        if let Some(reason) = inner.budget_exhausted(false) {
            return reason.to_string();
        }

        let title = format!("Free-run turn {}/{}", turn, max_turns);
        let task = match inner
            .queue
            .add(workspace, &title, &free_run_prompt(workspace, turn, max_turns))
        {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!("Could not queue free-run task: {}", e);
                return format!("aborted: {}", e);
            }
        };

        match inner.step_when_free(workspace, Some(&task.id), cancel).await {
            Ok(RunResult::Skipped { reason }) => return reason.to_string(),
            Ok(result) => tracing::info!("{}", result.summary()),
            Err(e) => {
                tracing::warn!("Autonomy run aborted: {}", e);
                return format!("aborted: {}", e);
            }
        }
    }
    "turn budget exhausted".to_string()
}

/// Composite status for `autonomy status` and UI polling.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AutonomyStatus {
    pub config: Autonomy,
    pub access: AccessPolicy,
    pub workspace: PathBuf,
    pub runtime: AutonomyRuntimeState,
    pub queue: QueueSummary,
    pub lock: Option<RuntimeLock>,
    pub stale_lock: bool,
}

/// Handle to the process-wide autonomy runtime. Clones share state.
#[derive(Clone)]
pub struct AutonomyRuntime {
    inner: Arc<Inner>,
}

impl AutonomyRuntime {
    pub fn new(queue: TaskQueue, adapter: Arc<dyn TurnAdapter>, settings: Settings, paths: Paths) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue,
                adapter,
                settings: RwLock::new(settings),
                paths,
                slot: Mutex::new(Slot {
                    state: AutonomyRuntimeState::default(),
                    started: None,
                    cancel: None,
                }),
                step_in_flight: AtomicBool::new(false),
                running_tx,
            }),
        }
    }

    /// Runtime wired to the configured provider CLI and the file-backed queue.
    pub fn from_settings(settings: Settings, paths: Paths) -> Self {
        let provider = get_current_provider(&settings);
        let adapter = ProviderTurnAdapter::new(provider, &settings).with_memory(&paths);
        let queue = TaskQueue::open(paths.queue_dir());
        Self::new(queue, Arc::new(adapter), settings, paths)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings()
    }

    /// Swap in freshly loaded settings. Budgets of an active run are unaffected.
    pub fn update_settings(&self, settings: Settings) {
        *self.inner.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Snapshot of the runtime state.
    pub fn state(&self) -> AutonomyRuntimeState {
        self.inner.slot().state.clone()
    }

    /// True while a run is active here or a live run lock names another process.
    pub fn run_active(&self) -> bool {
        self.state().running || lock::foreign_run(&self.inner.paths.runtime_lock_file()).is_some()
    }

    /// Execute the next pending task of `workspace`, if any.
    ///
    /// Access violations are returned as errors; everything else is folded
    /// into the [`RunResult`].
    pub async fn run_next_queued_task(&self, workspace: &Path) -> Result<RunResult, Error> {
        self.run_next_queued_task_with(workspace, &CancellationToken::new()).await
    }

    /// Like [`run_next_queued_task`](Self::run_next_queued_task), aborting the
    /// model turn when `cancel` fires.
    pub async fn run_next_queued_task_with(
        &self,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunResult, Error> {
        if self.run_active() {
            return Ok(RunResult::skipped(SkipReason::RunActive));
        }
        self.inner.step(workspace, None, cancel).await
    }

    /// Start a timed run in the background.
    pub fn start_run(&self, request: RunRequest) -> Result<StartOutcome, Error> {
        if self.run_active() {
            return Ok(self.rejected_start());
        }

        let workspace = workspace::resolve(&request.workspace);
        self.inner.check_access(&workspace)?;

        let cancel = CancellationToken::new();
        let started_at = Utc::now();
        let state = {
            let mut slot = self.inner.slot();
            if slot.state.running {
                drop(slot);
                return Ok(self.rejected_start());
            }
            slot.state = AutonomyRuntimeState {
                running: true,
                mode: Some(request.mode),
                started_at: Some(started_at),
                workspace: Some(workspace.clone()),
                turns_completed: 0,
                max_turns: request.max_turns,
                max_minutes: request.max_minutes,
                stop_requested: false,
                active_task_id: None,
            };
            slot.started = Some(Instant::now());
            slot.cancel = Some(cancel.clone());
            self.inner.running_tx.send_replace(true);
            slot.state.clone()
        };

        let record = RuntimeLock::for_current_process(
            request.mode,
            &workspace,
            request.max_turns,
            request.max_minutes,
            started_at,
        );
        if let Err(e) = lock::write_lock(&self.inner.paths.runtime_lock_file(), &record) {
            tracing::warn!("Could not write runtime lock: {}", e);
        }

        tracing::info!(
            "Autonomy run started: mode={} workspace={} max_turns={} max_minutes={}",
            request.mode,
            workspace.display(),
            request.max_turns,
            request.max_minutes
        );

        let inner = self.inner.clone();
        let mode = request.mode;
        tokio::spawn(async move {
            let body = tokio::spawn(run_loop(inner.clone(), mode, workspace, cancel));
            if let Err(e) = body.await {
                tracing::error!("Autonomy run loop aborted: {}", e);
            }
            inner.finish_run();
        });

        Ok(StartOutcome {
            started: true,
            reason: None,
            state,
        })
    }

    fn rejected_start(&self) -> StartOutcome {
        tracing::debug!("Autonomy run already active; start rejected");
        StartOutcome {
            started: false,
            reason: Some(StartRejection::AlreadyRunning),
            state: self.state(),
        }
    }

    /// Request a stop and wait until the run loop has fully exited.
    pub async fn stop_run(&self) -> StopOutcome {
        let cancel = {
            let mut slot = self.inner.slot();
            if slot.state.running {
                slot.state.stop_requested = true;
                Some(slot.cancel.clone())
            } else {
                None
            }
        };

        let Some(cancel) = cancel else {
            if lock::remove_lock(&self.inner.paths.runtime_lock_file()) {
                tracing::info!("Removed stray runtime lock");
            }
            return StopOutcome {
                stopped: false,
                reason: Some(StopRejection::NotRunning),
                state: self.state(),
            };
        };

        tracing::info!("Stopping autonomy run");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.wait_idle().await;

        StopOutcome {
            stopped: true,
            reason: None,
            state: self.state(),
        }
    }

    /// Resolve once no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.running_tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn status(&self) -> AutonomyStatus {
        let settings = self.inner.settings();
        let runtime = self.state();
        let workspace = match (&runtime.workspace, runtime.running) {
            (Some(ws), true) => ws.clone(),
            _ => settings.default_workspace(),
        };
        let lock = lock::read_lock(&self.inner.paths.runtime_lock_file());
        let stale_lock = lock.as_ref().map_or(false, |l| l.is_stale(runtime.running));

        AutonomyStatus {
            config: settings.autonomy.clone(),
            access: settings.access.clone(),
            queue: self.inner.queue.summary(&workspace),
            workspace,
            runtime,
            lock,
            stale_lock,
        }
    }
}
