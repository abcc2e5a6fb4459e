//! Periodic reconciliation.
//!
//! The notification primitive can lose a watch (the watched inode was
//! replaced, the watch was removed out of band) or drop events outright.
//! Every interval each registered target is re-resolved; an identity that
//! moved on without a delivered event is reported here and its watch is
//! re-armed. The interval bounds detection latency when the primitive fails.
//!
//! When raw events were dropped the changed entry of a directory target is
//! unknown, so every present directory target gets one event on the next
//! pass.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::identity::{ResolveError, TargetKind, resolve};
use super::registry::Observation;
use super::state::Shared;

/// Reconcile every `period` until cancelled. The first pass runs one period
/// after start.
pub(crate) async fn run(shared: Arc<Shared>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    crate::debug_event!("reconcile", "started", "every {period:?}");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let shared = shared.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || reconcile_once(&shared)).await {
                    tracing::error!("[reconcile] pass failed: {e}");
                }
            }
        }
    }

    crate::debug_event!("reconcile", "stopped");
}

/// One pass over a registry snapshot. Returns the number of events delivered.
pub(crate) fn reconcile_once(shared: &Shared) -> usize {
    let rescan = shared.overflow.take();
    if rescan {
        crate::debug_event!("reconcile", "rescan", "raw events were dropped");
    }

    let targets = shared.registry.lock().snapshot();
    let mut delivered = 0;

    for target in targets {
        let resolved = match resolve(&target.path) {
            Ok(resolved) => Some(resolved),
            Err(ResolveError::NotFound) => None,
            Err(e) => {
                tracing::warn!("[reconcile] cannot resolve {}: {e}", target.path.display());
                continue;
            }
        };

        let observation = shared.registry.lock().observe(&target.path, resolved);

        match observation {
            Observation::Changed { watch_dir } => {
                rearm(shared, &watch_dir);
                let identity = resolved.map(|r| r.id);
                if shared.deliver("reconcile", &target.path, &target.path, identity) {
                    delivered += 1;
                }
            }
            Observation::Unchanged if rescan && target.kind == TargetKind::Directory => {
                shared.announce("reconcile", &target.path);
                delivered += 1;
            }
            Observation::Missing if target.present => {
                crate::debug_event!("reconcile", "missing", "{}", target.path.display());
            }
            _ => {}
        }
    }

    shared.debouncer.lock().prune();
    delivered
}

fn rearm(shared: &Shared, watch_dir: &Path) {
    let mut source = shared.source.lock();
    // A remove may have released the directory since it was observed.
    if !shared.registry.lock().uses_watch_dir(watch_dir) {
        return;
    }
    if let Err(e) = source.rearm(watch_dir) {
        tracing::warn!("[reconcile] failed to re-arm {}: {e}", watch_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::debouncer::Debouncer;
    use crate::watcher::error::WatchError;
    use crate::watcher::handler::WatcherEvent;
    use crate::watcher::registry::WatchedTarget;
    use crate::watcher::source::EventSource;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Records re-arm requests instead of watching anything.
    struct RecordingSource {
        rearmed: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl EventSource for RecordingSource {
        fn name(&self) -> &str {
            "recording"
        }
        fn arm(&mut self, _dir: &Path) -> Result<(), WatchError> {
            Ok(())
        }
        fn disarm(&mut self, _dir: &Path) {}
        fn rearm(&mut self, dir: &Path) -> Result<(), WatchError> {
            self.rearmed.lock().push(dir.to_path_buf());
            Ok(())
        }
        fn armed_count(&self) -> usize {
            0
        }
        fn close(&mut self) {}
    }

    fn shared_with(
        window: Duration,
    ) -> (Shared, Arc<Mutex<Vec<PathBuf>>>, Arc<Mutex<Vec<PathBuf>>>) {
        let rearmed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let shared = Shared::new(
            Box::new(RecordingSource {
                rearmed: rearmed.clone(),
            }),
            Arc::default(),
            Debouncer::new(window),
            Box::new(move |event: &WatcherEvent| {
                sink.lock().push(event.path.clone());
                Ok(())
            }),
        );
        (shared, rearmed, seen)
    }

    fn register(shared: &Shared, path: &Path) {
        let target = WatchedTarget::new(path.to_path_buf(), resolve(path).unwrap());
        shared.registry.lock().insert(target);
    }

    #[test]
    fn test_unchanged_targets_quiet() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let file = root.join("agent.hcl");
        fs::write(&file, "a").unwrap();
        let (shared, rearmed, seen) = shared_with(Duration::from_secs(60));
        register(&shared, &file);
        register(&shared, &root);

        fs::write(&file, "in place").unwrap();
        assert_eq!(reconcile_once(&shared), 0);
        assert!(seen.lock().is_empty());
        assert!(rearmed.lock().is_empty());
    }

    #[test]
    fn test_replaced_file_reported_and_rearmed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let file = root.join("agent.hcl");
        let staged = root.join("agent.hcl.tmp");
        fs::write(&file, "a").unwrap();
        let (shared, rearmed, seen) = shared_with(Duration::from_secs(60));
        register(&shared, &file);

        fs::write(&staged, "b").unwrap();
        fs::rename(&staged, &file).unwrap();

        assert_eq!(reconcile_once(&shared), 1);
        assert_eq!(reconcile_once(&shared), 0);
        assert_eq!(*seen.lock(), vec![file.clone()]);
        assert_eq!(*rearmed.lock(), vec![root.clone()]);
        assert_eq!(
            shared.registry.lock().get(&file).unwrap().identity,
            resolve(&file).unwrap().id
        );
    }

    #[test]
    fn test_delete_then_recreate_reported_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let file = root.join("agent.hcl");
        fs::write(&file, "a").unwrap();
        let (shared, _rearmed, seen) = shared_with(Duration::from_secs(60));
        register(&shared, &file);

        fs::remove_file(&file).unwrap();
        assert_eq!(reconcile_once(&shared), 0);
        assert!(!shared.registry.lock().get(&file).unwrap().present);

        fs::write(&file, "config 2").unwrap();
        assert_eq!(reconcile_once(&shared), 1);
        assert_eq!(reconcile_once(&shared), 0);
        assert_eq!(seen.lock().len(), 1);

        let target = shared.registry.lock().get(&file).cloned().unwrap();
        assert!(target.present);
        assert_eq!(target.identity, resolve(&file).unwrap().id);
    }

    #[test]
    fn test_removed_target_not_rearmed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let file = root.join("agent.hcl");
        fs::write(&file, "a").unwrap();
        let (shared, rearmed, _seen) = shared_with(Duration::from_secs(60));
        register(&shared, &file);

        rearm(&shared, &root);
        assert_eq!(*rearmed.lock(), vec![root.clone()]);

        shared.registry.lock().remove(&file);
        rearm(&shared, &root);
        assert_eq!(rearmed.lock().len(), 1);
    }

    #[test]
    fn test_lost_events_rescan_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let conf_d = root.join("conf.d");
        fs::create_dir(&conf_d).unwrap();
        let file = root.join("agent.hcl");
        fs::write(&file, "a").unwrap();
        let (shared, rearmed, seen) = shared_with(Duration::from_secs(60));
        register(&shared, &conf_d);
        register(&shared, &file);

        // What the backend thread does when the channel is full.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mut forward = crate::watcher::source::forward_to(tx, shared.overflow.clone());
        let created = notify::Event::new(notify::EventKind::Create(
            notify::event::CreateKind::File,
        ))
        .add_path(conf_d.join("a.json"))
        .add_path(conf_d.join("b.json"));
        forward(Ok(created));

        assert_eq!(reconcile_once(&shared), 1);
        assert_eq!(*seen.lock(), vec![conf_d.clone()]);
        assert!(rearmed.lock().is_empty());

        // Cleared by the pass.
        assert_eq!(reconcile_once(&shared), 0);
        assert_eq!(shared.stats().dropped_events, 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (shared, _rearmed, _seen) = shared_with(Duration::from_millis(20));
        let token = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::new(shared),
            Duration::from_millis(20),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(70)).await;
        token.cancel();
        task.await.unwrap();
    }
}
