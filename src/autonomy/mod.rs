//! Autonomy: timed runs over the workspace task queue.

pub mod lock;
pub mod runtime;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use lock::RuntimeLock;
pub use runtime::{AutonomyRuntime, AutonomyStatus};
pub use state::{
    AutonomyMode, AutonomyRuntimeState, RunRequest, RunResult, SkipReason, StartOutcome,
    StartRejection, StopOutcome, StopRejection,
};
