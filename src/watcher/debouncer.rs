//! Collapsing of duplicate change detections.
//!
//! The dispatcher and the reconcile loop can both notice the same replace,
//! and a single rename usually produces more than one raw event. A detection
//! is keyed by the entry that changed and the identity it resolved to; a
//! repeat of the last delivered key within the window is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::identity::FileId;

/// Per-entry record of the last delivered change.
#[derive(Debug)]
pub(crate) struct Debouncer {
    /// entry path -> (identity delivered, when).
    delivered: HashMap<PathBuf, (Option<FileId>, Instant)>,
    /// Window during which a repeat is considered the same change.
    window: Duration,
}

impl Debouncer {
    /// Create a debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            delivered: HashMap::new(),
            window,
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Decide whether a detection should be delivered, recording it if so.
    pub fn admit(&mut self, entry: &Path, identity: Option<FileId>) -> bool {
        self.admit_at(entry, identity, Instant::now())
    }

    fn admit_at(&mut self, entry: &Path, identity: Option<FileId>, now: Instant) -> bool {
        if let Some((last_id, at)) = self.delivered.get(entry)
            && *last_id == identity
            && now.duration_since(*at) < self.window
        {
            return false;
        }

        self.delivered.insert(entry.to_path_buf(), (identity, now));
        true
    }

    /// Forget every record at or below `path` (e.g. when a target is removed).
    pub fn forget(&mut self, path: &Path) {
        self.delivered.retain(|entry, _| !entry.starts_with(path));
    }

    /// Drop records older than the window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.delivered
            .retain(|_, (_, at)| now.duration_since(*at) < window);
    }

    pub fn clear(&mut self) {
        self.delivered.clear();
    }
}
