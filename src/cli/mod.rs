//! CLI commands for agentloop using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::autonomy::{lock, AutonomyMode, AutonomyRuntime, RunRequest, RuntimeLock};
use crate::config::{self, Paths, Settings, HOME_ENV};
use crate::error::Error;
use crate::heartbeat::{self, Heartbeat};
use crate::providers::get_current_provider;
use crate::queue::{QueueTask, TaskQueue};
use crate::workspace;

/// How long a stop waits for a run in another process to exit.
const STOP_WAIT: Duration = Duration::from_secs(10);

/// agentloop - queue prompts for a coding agent CLI and let it work through them.
#[derive(Parser)]
#[command(name = "agentloop")]
#[command(version)]
#[command(about = "Autonomy runtime and task queue for coding agent CLIs", long_about = None)]
pub struct Commands {
    /// Home directory for settings, queues and logs
    #[arg(long, global = true, env = HOME_ENV)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Workspace task queue
    #[command(subcommand, alias = "q")]
    Queue(QueueCommand),

    /// Timed autonomy runs
    #[command(subcommand)]
    Autonomy(AutonomyCommand),

    /// Run the heartbeat loop in the foreground
    Heartbeat {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,

        #[command(subcommand)]
        action: Option<HeartbeatCommand>,
    },

    /// Check settings, provider and on-disk state
    Doctor,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Add a task to the end of the queue
    Add {
        /// Short task title
        title: String,

        /// Prompt sent to the model
        prompt: String,

        /// Workspace (default: configured workspace or current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// List tasks in queue order
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Remove a task by id
    #[command(alias = "rm")]
    Remove {
        id: String,

        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Remove every task
    Clear {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Execute the next pending task now
    RunNext {
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum AutonomyCommand {
    /// Start a run and stay in the foreground until it ends (Ctrl+C stops it)
    Start {
        /// queued or free-run (default: settings)
        #[arg(long)]
        mode: Option<AutonomyMode>,

        #[arg(long)]
        max_turns: Option<u32>,

        #[arg(long)]
        max_minutes: Option<u64>,

        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Show configuration, queue and runtime lock
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop an active run, or clear a stale runtime lock
    Stop,

    /// Allow the heartbeat to advance the queue
    Enable {
        #[arg(long)]
        mode: Option<AutonomyMode>,
    },

    /// Stop the heartbeat from advancing the queue
    Disable,
}

#[derive(Subcommand)]
pub enum HeartbeatCommand {
    /// Show the last persisted heartbeat state
    Status,
}

impl Commands {
    /// Resolve the home directory from `--home`, the environment or the default.
    pub fn paths(&self) -> Result<Paths> {
        match &self.home {
            Some(home) => Ok(Paths::new(home)),
            None => Ok(Paths::from_env()?),
        }
    }

    /// Run the command.
    pub async fn run(&self, paths: &Paths) -> Result<()> {
        match &self.command {
            Command::Queue(cmd) => cmd_queue(cmd, paths).await,
            Command::Autonomy(cmd) => cmd_autonomy(cmd, paths).await,
            Command::Heartbeat { once, action } => cmd_heartbeat(*once, action.as_ref(), paths).await,
            Command::Doctor => cmd_doctor(paths).await,
        }
    }
}

fn target_workspace(arg: Option<&PathBuf>, settings: &Settings) -> PathBuf {
    match arg {
        Some(path) => workspace::resolve(path),
        None => settings.default_workspace(),
    }
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

fn task_line(task: &QueueTask) -> String {
    let mut line = format!("  {}  [{}]  {}", task.id, task.status, task.title);
    if let Some(err) = task.last_error.as_deref() {
        line.push_str(&format!("  ({})", err.lines().next().unwrap_or("")));
    }
    line
}

async fn cmd_queue(cmd: &QueueCommand, paths: &Paths) -> Result<()> {
    let settings = config::load_settings(paths)?;
    let queue = TaskQueue::open(paths.queue_dir());

    match cmd {
        QueueCommand::Add { title, prompt, workspace } => {
            let ws = target_workspace(workspace.as_ref(), &settings);
            let task = queue.add(&ws, title, prompt)?;
            println!("Queued {}: {}", task.id, task.title);
        }
        QueueCommand::List { workspace } => {
            let ws = target_workspace(workspace.as_ref(), &settings);
            let tasks = queue.list(&ws);
            if tasks.is_empty() {
                println!("No tasks queued for {}", ws.display());
            } else {
                println!("Tasks for {} ({}):", ws.display(), queue.summary(&ws));
                for task in &tasks {
                    println!("{}", task_line(task));
                }
            }
        }
        QueueCommand::Remove { id, workspace } => {
            let ws = target_workspace(workspace.as_ref(), &settings);
            if !queue.remove(&ws, id)? {
                return Err(Error::NotFound(format!("task {} in {}", id, ws.display())).into());
            }
            println!("Removed task {}", id);
        }
        QueueCommand::Clear { workspace } => {
            let ws = target_workspace(workspace.as_ref(), &settings);
            let removed = queue.clear(&ws)?;
            println!("Cleared {} tasks from {}", removed, ws.display());
        }
        QueueCommand::RunNext { workspace } => {
            let ws = target_workspace(workspace.as_ref(), &settings);
            let runtime = AutonomyRuntime::from_settings(settings, paths.clone());
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let result = runtime.run_next_queued_task_with(&ws, &cancel).await?;
            println!("{}", result.summary());
        }
    }

    Ok(())
}

async fn cmd_autonomy(cmd: &AutonomyCommand, paths: &Paths) -> Result<()> {
    match cmd {
        AutonomyCommand::Start {
            mode,
            max_turns,
            max_minutes,
            workspace,
        } => {
            let settings = config::load_settings(paths)?;
            let request = RunRequest {
                mode: mode.unwrap_or(settings.autonomy.mode),
                workspace: target_workspace(workspace.as_ref(), &settings),
                max_turns: max_turns.unwrap_or(settings.autonomy.max_turns),
                max_minutes: max_minutes.unwrap_or(settings.autonomy.max_minutes),
            };
            cmd_autonomy_start(request, settings, paths).await
        }
        AutonomyCommand::Status { json } => {
            let settings = config::load_settings(paths)?;
            let status = AutonomyRuntime::from_settings(settings, paths.clone()).status();
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            let config = &status.config;
            println!(
                "Autonomy: {} (mode {}, max {} turns / {} min)",
                if config.enabled { "enabled" } else { "disabled" },
                config.mode,
                config.max_turns,
                config.max_minutes
            );
            println!("Access: {}", status.access.scope);
            println!("Workspace: {}", status.workspace.display());
            println!("Queue: {}", status.queue);
            match &status.lock {
                Some(lock) => println!("Runtime lock: {}", describe_lock(lock, status.stale_lock)),
                None => println!("Runtime lock: none"),
            }
            Ok(())
        }
        AutonomyCommand::Stop => cmd_autonomy_stop(paths).await,
        AutonomyCommand::Enable { mode } => {
            let mut settings = config::load_settings(paths)?;
            settings.autonomy.enabled = true;
            if let Some(mode) = mode {
                settings.autonomy.mode = *mode;
            }
            config::save_settings(paths, &settings)?;
            println!("Autonomy enabled (mode {})", settings.autonomy.mode);
            Ok(())
        }
        AutonomyCommand::Disable => {
            let mut settings = config::load_settings(paths)?;
            settings.autonomy.enabled = false;
            config::save_settings(paths, &settings)?;
            println!("Autonomy disabled; {}", stop_active_run(paths).await);
            Ok(())
        }
    }
}

fn describe_lock(lock: &RuntimeLock, stale: bool) -> String {
    format!(
        "pid {} ({} in {}, started {}){}",
        lock.pid,
        lock.mode,
        lock.workspace.display(),
        lock.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        if stale { " [stale]" } else { "" }
    )
}

async fn cmd_autonomy_start(request: RunRequest, settings: Settings, paths: &Paths) -> Result<()> {
    let runtime = AutonomyRuntime::from_settings(settings, paths.clone());

    let outcome = runtime.start_run(request)?;
    if !outcome.started {
        match lock::foreign_run(&paths.runtime_lock_file()) {
            Some(owner) => println!("Autonomy run already active: {}", describe_lock(&owner, false)),
            None => {
                let reason = outcome.reason.map(|r| r.to_string()).unwrap_or_default();
                println!("Autonomy run not started: {}", reason);
            }
        }
        return Ok(());
    }

    let state = &outcome.state;
    println!(
        "Autonomy run started ({} in {}, max {} turns / {} min). Press Ctrl+C to stop.",
        state.mode.unwrap_or_default(),
        state.workspace.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        state.max_turns,
        state.max_minutes
    );

    tokio::select! {
        _ = runtime.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping autonomy run...");
            runtime.stop_run().await;
        }
    }

    let status = runtime.status();
    println!(
        "Autonomy run finished: {} turns completed; queue: {}",
        status.runtime.turns_completed, status.queue
    );
    Ok(())
}

async fn cmd_autonomy_stop(paths: &Paths) -> Result<()> {
    println!("{}", capitalize(&stop_active_run(paths).await));
    Ok(())
}

/// Stop whichever run is active, here or in another process, and describe
/// what happened.
async fn stop_active_run(paths: &Paths) -> String {
    let lock_path = paths.runtime_lock_file();
    if let Some(owner) = lock::foreign_run(&lock_path) {
        // The foreground `autonomy start` process stops cleanly on SIGINT.
        let sent = std::process::Command::new("kill")
            .arg("-INT")
            .arg(owner.pid.to_string())
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !sent {
            return format!("could not signal autonomy run (pid {})", owner.pid);
        }

        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        while tokio::time::Instant::now() < deadline {
            if lock::foreign_run(&lock_path).is_none() {
                return format!("autonomy run stopped (pid {})", owner.pid);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tracing::warn!("Autonomy run (pid {}) still active after stop signal", owner.pid);
        return format!("sent stop signal to autonomy run (pid {}); still shutting down", owner.pid);
    }

    let settings = config::load_settings_or_default(paths);
    let had_lock = lock_path.exists();
    let outcome = AutonomyRuntime::from_settings(settings, paths.clone()).stop_run().await;
    match outcome.reason {
        Some(reason) if had_lock => format!("{} (cleared stale runtime lock)", reason),
        Some(reason) => reason.to_string(),
        None => "autonomy run stopped".to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn cmd_heartbeat(once: bool, action: Option<&HeartbeatCommand>, paths: &Paths) -> Result<()> {
    if let Some(HeartbeatCommand::Status) = action {
        match heartbeat::read_status(&paths.heartbeat_state_file()) {
            Some(status) => {
                let last_tick = status
                    .last_tick_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "Heartbeat {}: last tick {}, autonomy {}, run {}, last error: {} ({})",
                    if status.enabled { "enabled" } else { "disabled" },
                    last_tick,
                    if status.autonomy_enabled { "enabled" } else { "disabled" },
                    if status.active_run { "active" } else { "idle" },
                    status.last_error.as_deref().unwrap_or("none"),
                    status.runtime
                );
            }
            None => println!("No heartbeat recorded yet"),
        }
        return Ok(());
    }

    if once {
        let settings = config::load_settings(paths)?;
        let interval = Duration::from_secs(settings.heartbeat.interval_secs);
        let heartbeat = Heartbeat::new(AutonomyRuntime::from_settings(settings, paths.clone()), interval);
        println!("Heartbeat tick: {}", heartbeat.tick().await);
        return Ok(());
    }

    println!("Heartbeat running. Press Ctrl+C to stop.");
    heartbeat::run_heartbeat_daemon(paths.clone()).await?;
    Ok(())
}

async fn cmd_doctor(paths: &Paths) -> Result<()> {
    println!("Running agentloop diagnostics...\n");
    let mut issues = Vec::new();

    println!("Home: {}", paths.home().display());

    let settings = match config::load_settings(paths) {
        Ok(settings) => {
            println!("Settings: ok ({})", paths.settings_file().display());
            settings
        }
        Err(e) => {
            println!("Settings: error");
            issues.push(format!("Settings error: {}", e));
            Settings::default()
        }
    };

    let provider = get_current_provider(&settings);
    if provider.is_available().await {
        println!("Provider: {} (available)", provider.name());
    } else {
        println!("Provider: {} (not found)", provider.name());
        issues.push(format!("Provider CLI '{}' is not available", provider.name()));
    }

    let ws = settings.default_workspace();
    if ws.is_dir() {
        println!("Workspace: {}", ws.display());
    } else {
        println!("Workspace: {} (missing)", ws.display());
        issues.push(format!("Workspace path missing: {}", ws.display()));
    }
    println!("Access: {}", settings.access.scope);

    let runtime = AutonomyRuntime::from_settings(settings, paths.clone());
    let status = runtime.status();
    println!("Queue: {} ({})", status.queue, runtime.queue().location(&status.workspace));
    match &status.lock {
        Some(lock) if status.stale_lock => {
            println!("Runtime lock: {}", describe_lock(lock, true));
            issues.push("Stale runtime lock; run `agentloop autonomy stop` to clear it".to_string());
        }
        Some(lock) => println!("Runtime lock: {}", describe_lock(lock, false)),
        None => println!("Runtime lock: none"),
    }
    match heartbeat::read_status(&paths.heartbeat_state_file()).and_then(|s| s.last_tick_at) {
        Some(at) => println!("Heartbeat: last tick {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Heartbeat: never ran"),
    }

    println!();
    if issues.is_empty() {
        println!("All checks passed");
        return Ok(());
    }
    for issue in &issues {
        println!("  - {}", issue);
    }
    anyhow::bail!("{} issue(s) found", issues.len())
}
