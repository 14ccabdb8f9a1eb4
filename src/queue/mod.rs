//! Workspace task queue.

pub mod store;
pub mod task;

pub use store::{FileBackend, QueueBackend, TaskQueue};
pub use task::{QueueSummary, QueueTask, StatusUpdate, TaskStatus, WorkspaceQueueState};
