//! Adapter over the OS change-notification primitive.
//!
//! The primitive is unreliable: watches vanish with their inode, events get
//! coalesced, and every platform reports renames differently. This module
//! only translates its output into `(path, op)` pairs and keeps track of what
//! is armed. Interpretation happens in the dispatcher.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::error::WatchError;

/// Filesystem operation as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Create,
    Write,
    Rename,
    Remove,
    Chmod,
}

impl Op {
    /// Map a notify event kind, dropping kinds with no counterpart (access, any).
    pub fn from_kind(kind: &EventKind) -> Option<Op> {
        match kind {
            EventKind::Create(_) => Some(Op::Create),
            EventKind::Modify(ModifyKind::Name(_)) => Some(Op::Rename),
            EventKind::Modify(ModifyKind::Metadata(_)) => Some(Op::Chmod),
            EventKind::Modify(_) => Some(Op::Write),
            EventKind::Remove(_) => Some(Op::Remove),
            _ => None,
        }
    }

    /// Whether a new directory entry appeared under the event's name.
    pub fn is_change(self) -> bool {
        matches!(self, Op::Create | Op::Rename)
    }
}

/// One path touched by one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEvent {
    pub path: PathBuf,
    pub op: Op,
}

impl RawEvent {
    /// Split a notify event into one raw event per path.
    pub fn from_notify(event: Event) -> Vec<RawEvent> {
        let Some(op) = Op::from_kind(&event.kind) else {
            return Vec::new();
        };

        event
            .paths
            .into_iter()
            .map(|path| RawEvent { path, op })
            .collect()
    }
}

/// Capability interface the watcher needs from a notification backend.
pub(crate) trait EventSource: Send {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Watch `dir` non-recursively. No-op if already armed.
    fn arm(&mut self, dir: &Path) -> Result<(), WatchError>;

    /// Stop watching `dir`. No-op if not armed.
    fn disarm(&mut self, dir: &Path);

    /// Drop and re-establish the watch on `dir`, repairing a lost watch.
    fn rearm(&mut self, dir: &Path) -> Result<(), WatchError>;

    fn armed_count(&self) -> usize;

    /// Release the primitive. Every later call is a no-op.
    fn close(&mut self);
}

/// [`EventSource`] backed by a `notify` watcher.
pub(crate) struct NotifySource<W: Watcher> {
    name: &'static str,
    watcher: Option<W>,
    armed: HashSet<PathBuf>,
}

impl NotifySource<RecommendedWatcher> {
    /// Native backend (inotify, FSEvents, kqueue, ReadDirectoryChanges).
    pub fn native(tx: mpsc::Sender<RawEvent>, overflow: Arc<Overflow>) -> Result<Self, WatchError> {
        let watcher = notify::recommended_watcher(forward_to(tx, overflow))?;
        Ok(Self::with_watcher("native", watcher))
    }
}

impl NotifySource<PollWatcher> {
    /// Polling backend for filesystems without native notifications.
    pub fn polling(
        tx: mpsc::Sender<RawEvent>,
        overflow: Arc<Overflow>,
        interval: Duration,
    ) -> Result<Self, WatchError> {
        let config = Config::default().with_poll_interval(interval);
        let watcher = PollWatcher::new(forward_to(tx, overflow), config)?;
        Ok(Self::with_watcher("poll", watcher))
    }
}

impl<W: Watcher> NotifySource<W> {
    fn with_watcher(name: &'static str, watcher: W) -> Self {
        Self {
            name,
            watcher: Some(watcher),
            armed: HashSet::new(),
        }
    }

    fn watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatchError::Closed);
        };

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::ArmFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn unwatch(&mut self, dir: &Path) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        if let Err(e) = watcher.unwatch(dir) {
            crate::debug_event!("source", "unwatch failed", "{}: {e}", dir.display());
        }
    }
}

impl<W: Watcher + Send> EventSource for NotifySource<W> {
    fn name(&self) -> &str {
        self.name
    }

    fn arm(&mut self, dir: &Path) -> Result<(), WatchError> {
        if self.armed.contains(dir) {
            return Ok(());
        }

        self.watch(dir)?;
        self.armed.insert(dir.to_path_buf());
        crate::debug_event!("source", "armed", "{}", dir.display());
        Ok(())
    }

    fn disarm(&mut self, dir: &Path) {
        if self.armed.remove(dir) {
            self.unwatch(dir);
            crate::debug_event!("source", "disarmed", "{}", dir.display());
        }
    }

    fn rearm(&mut self, dir: &Path) -> Result<(), WatchError> {
        self.armed.remove(dir);
        self.unwatch(dir);
        self.arm(dir)
    }

    fn armed_count(&self) -> usize {
        self.armed.len()
    }

    fn close(&mut self) {
        // Dropping the watcher releases every OS watch at once.
        self.armed.clear();
        self.watcher = None;
    }
}

/// Lost-event bookkeeping shared by the backend thread and the reconcile loop.
///
/// Set when the raw event channel was full or the backend itself reported a
/// queue overflow. The next reconcile pass clears it and rescans.
#[derive(Debug, Default)]
pub(crate) struct Overflow {
    pending: AtomicBool,
    dropped: AtomicU64,
}

impl Overflow {
    fn record(&self, dropped: u64) {
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Whether events were lost since the last call.
    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Raw events dropped on a full channel so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the notify callback that feeds the raw event channel.
///
/// Runs on the backend's own thread and must never block: `arm`, `unwatch`
/// and `close` wait on that thread. A full channel drops the event and flags
/// an overflow instead.
pub(super) fn forward_to(
    tx: mpsc::Sender<RawEvent>,
    overflow: Arc<Overflow>,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if event.need_rescan() {
                overflow.record(0);
                crate::debug_event!("source", "rescan requested");
            }
            for raw in RawEvent::from_notify(event) {
                match tx.try_send(raw) {
                    Ok(()) => {}
                    Err(TrySendError::Full(raw)) => {
                        overflow.record(1);
                        crate::debug_event!("source", "dropped", "{:?} {}", raw.op, raw.path.display());
                    }
                    // Receiver gone: the watcher is shutting down.
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
        Err(e) => {
            tracing::error!("[source] file watch error: {e}");
        }
    }
}
