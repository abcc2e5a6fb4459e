//! Error types for the config watcher.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Symbolic links are not supported: {path}")]
    UnsupportedSymlink { path: PathBuf },

    #[error("Cannot watch path {path}: {reason}")]
    ArmFailed { path: PathBuf, reason: String },

    #[error("Cannot stat {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watcher must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("Watcher is closed")]
    Closed,

    #[error("Background task '{task}' failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },

    #[error("Failed to load config: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}
