//! agentloop library root.

pub mod autonomy;
pub mod cli;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod policy;
pub mod providers;
pub mod queue;
pub mod turn;
pub mod workspace;

pub use autonomy::{AutonomyMode, AutonomyRuntime, RunRequest, RunResult};
pub use cli::Commands;
pub use config::{load_settings, Paths, Settings};
pub use error::{Error, Result};
pub use heartbeat::{run_heartbeat_daemon, Heartbeat};
pub use policy::{AccessPolicy, AccessScope};
pub use providers::Provider;
pub use queue::{QueueTask, TaskQueue, TaskStatus};
pub use turn::{ProviderTurnAdapter, TurnAdapter};
