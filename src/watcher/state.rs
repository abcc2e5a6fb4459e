//! State shared by the public handle, the dispatcher and the reconcile loop.
//!
//! Lock order is source, then registry. Calls into the event source (which
//! wait on the backend thread) are never made with the registry lock held,
//! and the dispatcher only ever takes the registry lock. The debouncer lock
//! is never held with either, and no lock is held while the callback runs.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::debouncer::Debouncer;
use super::handler::{Callback, WatcherEvent};
use super::identity::FileId;
use super::registry::Registry;
use super::source::{EventSource, Overflow};

pub(crate) struct Shared {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) source: Mutex<Box<dyn EventSource>>,
    pub(crate) debouncer: Mutex<Debouncer>,
    pub(crate) overflow: Arc<Overflow>,
    callback: Callback,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    callback_errors: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        source: Box<dyn EventSource>,
        overflow: Arc<Overflow>,
        debouncer: Debouncer,
        callback: Callback,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            source: Mutex::new(source),
            debouncer: Mutex::new(debouncer),
            overflow,
            callback,
            delivered: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
        }
    }

    /// Deliver a detected change of `entry` to the subscriber as an event for
    /// `target`, unless it repeats one already delivered.
    ///
    /// Returns whether the callback was invoked.
    pub(crate) fn deliver(
        &self,
        origin: &str,
        target: &Path,
        entry: &Path,
        identity: Option<FileId>,
    ) -> bool {
        if !self.debouncer.lock().admit(entry, identity) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            crate::debug_event!(origin, "debounced", "{}", entry.display());
            return false;
        }

        crate::log_event!(origin, "changed", "{}", target.display());
        self.invoke(origin, target);
        true
    }

    /// Deliver an event for `target` without consulting the debouncer.
    ///
    /// Used when raw events were lost and the changed entry is unknown.
    pub(crate) fn announce(&self, origin: &str, target: &Path) {
        crate::log_event!(origin, "rescanned", "{}", target.display());
        self.invoke(origin, target);
    }

    fn invoke(&self, origin: &str, target: &Path) {
        let event = WatcherEvent::new(target);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = (self.callback)(&event) {
            self.callback_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[{origin}] callback failed for {}: {e:#}", target.display());
        }
    }

    pub(crate) fn stats(&self) -> WatcherStats {
        let (targets, files, directories) = {
            let registry = self.registry.lock();
            (
                registry.len(),
                registry.count_kind(super::TargetKind::File),
                registry.count_kind(super::TargetKind::Directory),
            )
        };

        WatcherStats {
            targets,
            files,
            directories,
            armed_dirs: self.source.lock().armed_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            dropped_events: self.overflow.dropped(),
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Registered targets.
    pub targets: usize,
    pub files: usize,
    pub directories: usize,
    /// Directories currently watched by the event source.
    pub armed_dirs: usize,
    /// Events handed to the callback.
    pub delivered: u64,
    /// Detections dropped as duplicates.
    pub suppressed: u64,
    /// Deliveries whose callback returned an error.
    pub callback_errors: u64,
    /// Raw events dropped because the dispatcher fell behind. Directory
    /// targets are rescanned on the next reconcile pass.
    pub dropped_events: u64,
}
