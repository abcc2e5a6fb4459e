//! Subscriber-facing event type and callback signature.

use std::path::PathBuf;

/// A logical change to a watched target.
///
/// For a directory target `path` is the directory, whichever entry changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub path: PathBuf,
}

impl WatcherEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Subscriber invoked synchronously for every delivered event.
///
/// Errors are logged and counted; the delivery is never retried.
pub(crate) type Callback = Box<dyn Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync>;
