//! Registry of watched targets.
//!
//! Maps each registered path to its identity and kind, and computes which
//! directory the event source must watch for it. The registry itself is not
//! synchronized; the watcher keeps it behind a single mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::identity::{FileId, Resolved, TargetKind};

/// A registered path and its last known identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTarget {
    /// Absolute path as registered.
    pub path: PathBuf,
    /// File or directory, fixed at registration.
    pub kind: TargetKind,
    /// Identity of the object last seen at `path`.
    pub identity: FileId,
    /// Whether the last resolution found the path.
    pub present: bool,
}

impl WatchedTarget {
    pub fn new(path: PathBuf, resolved: Resolved) -> Self {
        Self {
            path,
            kind: resolved.kind,
            identity: resolved.id,
            present: true,
        }
    }

    /// Directory the event source watches for this target.
    ///
    /// Files are watched through their parent so that a rename over the file
    /// does not take the watch down with the old inode.
    pub fn watch_dir(&self) -> PathBuf {
        watch_dir_for(&self.path, self.kind)
    }
}

/// Outcome of comparing a fresh resolution against the stored identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observation {
    /// Path is not registered (removed concurrently).
    Untracked,
    /// Same object, still present.
    Unchanged,
    /// A different object, or the path reappeared.
    Changed { watch_dir: PathBuf },
    /// Path is gone; the stale identity is kept.
    Missing,
}

/// Thread-unsafe map of watched targets, owned by the watcher.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    targets: HashMap<PathBuf, WatchedTarget>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a target, returning the previous entry.
    pub fn insert(&mut self, target: WatchedTarget) -> Option<WatchedTarget> {
        self.targets.insert(target.path.clone(), target)
    }

    /// Remove a target, returning it if it was registered.
    pub fn remove(&mut self, path: &Path) -> Option<WatchedTarget> {
        self.targets.remove(path)
    }

    pub fn get(&self, path: &Path) -> Option<&WatchedTarget> {
        self.targets.get(path)
    }

    /// Copy of every target, for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<WatchedTarget> {
        self.targets.values().cloned().collect()
    }

    /// Remove and return every target.
    pub fn drain(&mut self) -> Vec<WatchedTarget> {
        self.targets.drain().map(|(_, target)| target).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Number of targets of the given kind.
    pub fn count_kind(&self, kind: TargetKind) -> usize {
        self.targets.values().filter(|t| t.kind == kind).count()
    }

    /// Whether any registered target still needs `dir` watched.
    pub fn uses_watch_dir(&self, dir: &Path) -> bool {
        self.targets.values().any(|t| t.watch_dir() == dir)
    }

    /// Find the target a raw event path belongs to.
    ///
    /// An exact registration wins. Otherwise the path is attributed to a
    /// registered directory that holds it as a direct entry.
    pub fn attribute(&self, path: &Path) -> Option<&WatchedTarget> {
        if let Some(target) = self.targets.get(path) {
            return Some(target);
        }

        path.parent()
            .and_then(|parent| self.targets.get(parent))
            .filter(|target| target.kind == TargetKind::Directory)
    }

    /// Record a fresh resolution of `path` and classify it.
    ///
    /// `None` means the path was not found.
    pub fn observe(&mut self, path: &Path, resolved: Option<Resolved>) -> Observation {
        let Some(target) = self.targets.get_mut(path) else {
            return Observation::Untracked;
        };

        match resolved {
            None => {
                target.present = false;
                Observation::Missing
            }
            Some(resolved) if target.present && resolved.id == target.identity => {
                Observation::Unchanged
            }
            Some(resolved) => {
                target.identity = resolved.id;
                target.present = true;
                Observation::Changed {
                    watch_dir: target.watch_dir(),
                }
            }
        }
    }
}

/// Compute the watched directory for a path of the given kind.
pub(crate) fn watch_dir_for(path: &Path, kind: TargetKind) -> PathBuf {
    match kind {
        TargetKind::Directory => path.to_path_buf(),
        TargetKind::File => match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    }
}
