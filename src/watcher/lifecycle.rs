//! Public handle tying registry, event source and background tasks together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Backend, WatcherConfig};

use super::debouncer::Debouncer;
use super::dispatcher;
use super::error::WatchError;
use super::handler::WatcherEvent;
use super::identity::{ResolveError, resolve};
use super::reconcile;
use super::registry::WatchedTarget;
use super::source::{EventSource, NotifySource, Overflow, RawEvent};
use super::state::{Shared, WatcherStats};

/// Watches configuration files and directories for atomic replacement.
///
/// Construct with [`ConfigWatcher::new`], register targets with
/// [`add`](Self::add), then [`start`](Self::start) inside a Tokio runtime.
/// Targets may be added and removed at any time before [`close`](Self::close).
pub struct ConfigWatcher {
    shared: Arc<Shared>,
    /// Raw event receiver, handed to the dispatcher on start.
    events: Mutex<Option<mpsc::Receiver<RawEvent>>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    token: CancellationToken,
    reconcile_interval: Duration,
    started: AtomicBool,
    closed: AtomicBool,
}

impl ConfigWatcher {
    /// Create a watcher with the default configuration.
    pub fn new<F>(callback: F) -> Result<Self, WatchError>
    where
        F: Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_config(WatcherConfig::default(), callback)
    }

    /// Create a watcher with an explicit configuration.
    pub fn with_config<F>(config: WatcherConfig, callback: F) -> Result<Self, WatchError>
    where
        F: Fn(&WatcherEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_buffer);
        let overflow = Arc::new(Overflow::default());
        let source: Box<dyn EventSource> = match config.backend {
            Backend::Native => Box::new(NotifySource::native(tx, overflow.clone())?),
            Backend::Poll => Box::new(NotifySource::polling(
                tx,
                overflow.clone(),
                config.poll_interval(),
            )?),
        };

        crate::debug_event!("watcher", "created", "backend={}", source.name());

        let interval = config.reconcile_interval();
        Ok(Self {
            shared: Arc::new(Shared::new(
                source,
                overflow,
                Debouncer::new(interval),
                Box::new(callback),
            )),
            events: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            reconcile_interval: interval,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn the dispatcher and reconcile tasks on the current runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<(), WatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }

        let handle = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(events) = self.events.lock().take() else {
            return Ok(());
        };

        let dispatch = handle.spawn(dispatcher::run(
            self.shared.clone(),
            events,
            self.token.clone(),
        ));
        let reconcile = handle.spawn(reconcile::run(
            self.shared.clone(),
            self.reconcile_interval,
            self.token.clone(),
        ));

        self.tasks
            .lock()
            .extend([("dispatch", dispatch), ("reconcile", reconcile)]);

        crate::log_event!(
            "watcher",
            "started",
            "{} targets, reconcile every {:?}",
            self.shared.registry.lock().len(),
            self.reconcile_interval
        );
        Ok(())
    }

    /// Register a file or directory.
    ///
    /// A path that does not exist is skipped without error; call `add` again
    /// once it has been created. Re-adding a registered path refreshes its
    /// identity.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let path = absolute(path.as_ref())?;

        let resolved = match resolve(&path) {
            Ok(resolved) => resolved,
            Err(ResolveError::NotFound) => {
                crate::debug_event!("watcher", "skipped missing", "{}", path.display());
                return Ok(());
            }
            Err(ResolveError::UnsupportedSymlink { path }) => {
                return Err(WatchError::UnsupportedSymlink { path });
            }
            Err(ResolveError::Io { path, source }) => {
                return Err(WatchError::Io { path, source });
            }
        };

        let target = WatchedTarget::new(path.clone(), resolved);
        let watch_dir = target.watch_dir();

        {
            // Arming waits on the backend thread, so only the source lock is
            // held across it. The registry lock is taken briefly afterwards.
            let mut source = self.shared.source.lock();
            // close() releases the source under this lock after setting the flag.
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            source.arm(&watch_dir)?;

            let stale_dir = {
                let mut registry = self.shared.registry.lock();
                registry
                    .insert(target)
                    .map(|previous| previous.watch_dir())
                    .filter(|old_dir| *old_dir != watch_dir && !registry.uses_watch_dir(old_dir))
            };
            if let Some(old_dir) = stale_dir {
                source.disarm(&old_dir);
            }
        }

        crate::log_event!("watcher", "added", "{:?} {}", resolved.kind, path.display());
        Ok(())
    }

    /// Unregister a path. Unknown paths are ignored.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let Ok(path) = absolute(path.as_ref()) else {
            return;
        };

        let removed = {
            let mut source = self.shared.source.lock();
            let (removed, unused_dir) = {
                let mut registry = self.shared.registry.lock();
                let removed = registry.remove(&path);
                let unused_dir = removed
                    .as_ref()
                    .map(|target| target.watch_dir())
                    .filter(|dir| !registry.uses_watch_dir(dir));
                (removed, unused_dir)
            };
            if let Some(dir) = unused_dir {
                source.disarm(&dir);
            }
            removed
        };

        if removed.is_some() {
            self.shared.debouncer.lock().forget(&path);
            crate::log_event!("watcher", "removed", "{}", path.display());
        }
    }

    /// Current registry entry for `path`.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<WatchedTarget> {
        let path = absolute(path.as_ref()).ok()?;
        self.shared.registry.lock().get(&path).cloned()
    }

    /// Snapshot of every registered target.
    pub fn targets(&self) -> Vec<WatchedTarget> {
        self.shared.registry.lock().snapshot()
    }

    /// Override the reconcile period and debounce window.
    ///
    /// Takes effect at [`start`](Self::start). A zero duration is ignored.
    pub fn set_reconcile_interval(&mut self, interval: Duration) {
        if interval.is_zero() {
            tracing::warn!("[watcher] ignoring zero reconcile interval");
            return;
        }
        if self.started.load(Ordering::SeqCst) {
            tracing::warn!("[watcher] reconcile interval changed after start; applies to debounce only");
        }

        self.reconcile_interval = interval;
        self.shared.debouncer.lock().set_window(interval);
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
    }

    /// Whether background tasks are running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WatcherStats {
        self.shared.stats()
    }

    /// Stop background tasks and release every watch.
    ///
    /// Repeated calls are no-ops. A panicked task is reported after cleanup.
    pub async fn close(&self) -> Result<(), WatchError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.token.cancel();
        // Never started: nobody drains the channel. Dropping the receiver
        // makes the backend thread discard instead of queueing.
        self.events.lock().take();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut failure = None;
        for (task, handle) in tasks {
            if let Err(e) = handle.await {
                tracing::error!("[watcher] {task} task failed: {e}");
                if failure.is_none() {
                    failure = Some(WatchError::TaskFailed {
                        task,
                        reason: e.to_string(),
                    });
                }
            }
        }

        {
            let mut source = self.shared.source.lock();
            source.close();
            self.shared.registry.lock().drain();
        }
        self.shared.debouncer.lock().clear();

        crate::log_event!("watcher", "closed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn absolute(path: &Path) -> Result<PathBuf, WatchError> {
    std::path::absolute(path).map_err(|source| WatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}
