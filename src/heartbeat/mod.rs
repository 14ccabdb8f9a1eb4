//! Heartbeat: periodic liveness record and queue trigger.

pub mod daemon;
pub mod status;

pub use daemon::{run_heartbeat_daemon, Heartbeat, IdleReason, TickOutcome, TickSkip};
pub use status::{read_status, HeartbeatStatus};
