//! Error types for agentloop.

use std::path::PathBuf;

use thiserror::Error;

use crate::policy::AccessScope;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A workspace outside the configured access boundary.
    #[error(
        "Access denied: {} is outside the permitted boundary (scope={scope}, workspace root={})",
        path.display(),
        root.display()
    )]
    AccessDenied {
        path: PathBuf,
        scope: AccessScope,
        root: PathBuf,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied { .. })
    }
}
