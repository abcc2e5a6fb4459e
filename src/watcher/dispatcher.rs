//! Raw event dispatch.
//!
//! Turns the adapter's `(path, op)` stream into subscriber events:
//! attribute the path to a target, keep only operations that put a new
//! entry under a name, confirm the entry exists, debounce, deliver.
//!
//! Each event is handled on the blocking pool: resolution walks every
//! ancestor with `lstat` and the callback may take as long as it likes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::identity::{ResolveError, entry_id, resolve};
use super::registry::Observation;
use super::source::RawEvent;
use super::state::Shared;

/// Consume raw events until cancelled or the source goes away.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<RawEvent>,
    token: CancellationToken,
) {
    crate::debug_event!("dispatch", "started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            raw = events.recv() => match raw {
                Some(raw) => {
                    let shared = shared.clone();
                    // Awaited in turn, so events are still handled in order.
                    if let Err(e) = tokio::task::spawn_blocking(move || handle(&shared, raw)).await {
                        tracing::error!("[dispatch] event handling failed: {e}");
                    }
                }
                None => {
                    crate::debug_event!("dispatch", "event source closed");
                    break;
                }
            }
        }
    }

    crate::debug_event!("dispatch", "stopped");
}

/// Process one raw event. Returns whether an event was delivered.
pub(crate) fn handle(shared: &Shared, raw: RawEvent) -> bool {
    let attributed = shared
        .registry
        .lock()
        .attribute(&raw.path)
        .map(|target| target.path.clone());

    let Some(target) = attributed else {
        crate::debug_event!("dispatch", "unmatched", "{:?} {}", raw.op, raw.path.display());
        return false;
    };

    // Writes land in place and chmod is metadata churn; config is expected
    // to arrive by atomic replace. A bare remove is not new configuration.
    if !raw.op.is_change() {
        crate::debug_event!("dispatch", "ignored", "{:?} {}", raw.op, raw.path.display());
        return false;
    }

    // Renamed away, or created and removed before we got here.
    let Some(entry) = entry_id(&raw.path) else {
        if raw.path == target {
            shared.registry.lock().observe(&target, None);
        }
        crate::debug_event!("dispatch", "entry gone", "{}", raw.path.display());
        return false;
    };

    let resolved = match resolve(&target) {
        Ok(resolved) => Some(resolved),
        Err(ResolveError::NotFound) => None,
        Err(e) => {
            tracing::warn!("[dispatch] cannot resolve {}: {e}", target.display());
            return false;
        }
    };

    match shared.registry.lock().observe(&target, resolved) {
        Observation::Untracked | Observation::Missing => return false,
        Observation::Unchanged | Observation::Changed { .. } => {}
    }

    shared.deliver("dispatch", &target, &raw.path, Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::debouncer::Debouncer;
    use crate::watcher::error::WatchError;
    use crate::watcher::handler::WatcherEvent;
    use crate::watcher::registry::WatchedTarget;
    use crate::watcher::source::{EventSource, Op};
    use parking_lot::Mutex;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Source that arms nothing, so raw events can be injected by hand.
    struct NullSource;

    impl EventSource for NullSource {
        fn name(&self) -> &str {
            "null"
        }
        fn arm(&mut self, _dir: &Path) -> Result<(), WatchError> {
            Ok(())
        }
        fn disarm(&mut self, _dir: &Path) {}
        fn rearm(&mut self, _dir: &Path) -> Result<(), WatchError> {
            Ok(())
        }
        fn armed_count(&self) -> usize {
            0
        }
        fn close(&mut self) {}
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        shared: Shared,
        seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let shared = Shared::new(
            Box::new(NullSource),
            Arc::default(),
            Debouncer::new(Duration::from_secs(60)),
            Box::new(move |event: &WatcherEvent| {
                sink.lock().push(event.path.clone());
                Ok(())
            }),
        );
        Fixture {
            _temp: temp,
            root,
            shared,
            seen,
        }
    }

    fn register(shared: &Shared, path: &Path) {
        let target = WatchedTarget::new(path.to_path_buf(), resolve(path).unwrap());
        shared.registry.lock().insert(target);
    }

    fn raw(path: &Path, op: Op) -> RawEvent {
        RawEvent {
            path: path.to_path_buf(),
            op,
        }
    }

    #[test]
    fn test_rename_over_file_delivers_once() {
        let f = fixture();
        let file = f.root.join("agent.hcl");
        let staged = f.root.join("agent.hcl.tmp");
        fs::write(&file, "a").unwrap();
        register(&f.shared, &file);

        fs::write(&staged, "b").unwrap();
        fs::rename(&staged, &file).unwrap();

        // inotify reports the destination twice (To and Both).
        assert!(!handle(&f.shared, raw(&staged, Op::Rename)));
        assert!(handle(&f.shared, raw(&file, Op::Rename)));
        assert!(!handle(&f.shared, raw(&file, Op::Rename)));

        assert_eq!(*f.seen.lock(), vec![file.clone()]);
        let stored = f.shared.registry.lock().get(&file).unwrap().identity;
        assert_eq!(stored, resolve(&file).unwrap().id);
    }

    #[test]
    fn test_write_and_chmod_ignored() {
        let f = fixture();
        let file = f.root.join("agent.hcl");
        fs::write(&file, "a").unwrap();
        register(&f.shared, &file);

        assert!(!handle(&f.shared, raw(&file, Op::Write)));
        assert!(!handle(&f.shared, raw(&file, Op::Chmod)));
        assert!(!handle(&f.shared, raw(&file, Op::Remove)));
        assert!(f.seen.lock().is_empty());
    }

    #[test]
    fn test_unwatched_sibling_ignored() {
        let f = fixture();
        let file = f.root.join("agent.hcl");
        let other = f.root.join("other.hcl");
        fs::write(&file, "a").unwrap();
        fs::write(&other, "b").unwrap();
        register(&f.shared, &file);

        assert!(!handle(&f.shared, raw(&other, Op::Create)));
        assert!(f.seen.lock().is_empty());
    }

    #[test]
    fn test_directory_entry_attributed_to_directory() {
        let f = fixture();
        let conf_d = f.root.join("conf.d");
        fs::create_dir(&conf_d).unwrap();
        register(&f.shared, &conf_d);

        let entry = conf_d.join("service.json");
        fs::write(&entry, "{}").unwrap();
        assert!(handle(&f.shared, raw(&entry, Op::Create)));

        fs::remove_file(&entry).unwrap();
        assert!(!handle(&f.shared, raw(&entry, Op::Remove)));
        // A late create for an entry that is already gone is dropped too.
        assert!(!handle(&f.shared, raw(&entry, Op::Create)));

        assert_eq!(*f.seen.lock(), vec![conf_d.clone()]);
    }

    #[test]
    fn test_missing_target_suppressed_and_marked() {
        let f = fixture();
        let file = f.root.join("agent.hcl");
        let moved = f.root.join("agent.hcl.bak");
        fs::write(&file, "a").unwrap();
        register(&f.shared, &file);

        fs::rename(&file, &moved).unwrap();
        assert!(!handle(&f.shared, raw(&file, Op::Rename)));

        let target = f.shared.registry.lock().get(&file).cloned().unwrap();
        assert!(!target.present);
        assert!(f.seen.lock().is_empty());
    }

    #[test]
    fn test_callback_error_does_not_stop_delivery() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let shared = Shared::new(
            Box::new(NullSource),
            Arc::default(),
            Debouncer::new(Duration::from_secs(60)),
            Box::new(|_: &WatcherEvent| -> anyhow::Result<()> {
                anyhow::bail!("agent busy")
            }),
        );
        let conf_d = root.join("conf.d");
        fs::create_dir(&conf_d).unwrap();
        register(&shared, &conf_d);

        for name in ["a.json", "b.json"] {
            let entry = conf_d.join(name);
            fs::write(&entry, "{}").unwrap();
            assert!(handle(&shared, raw(&entry, Op::Create)));
        }

        let stats = shared.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.callback_errors, 2);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_stall_runtime() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let shared = Arc::new(Shared::new(
            Box::new(NullSource),
            Arc::default(),
            Debouncer::new(Duration::from_secs(60)),
            Box::new(|_: &WatcherEvent| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }),
        ));
        let conf_d = root.join("conf.d");
        fs::create_dir(&conf_d).unwrap();
        register(&shared, &conf_d);
        let entry = conf_d.join("service.json");
        fs::write(&entry, "{}").unwrap();

        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), rx, token.clone()));
        tx.send(raw(&entry, Op::Create)).await.unwrap();

        // On a current-thread runtime this timer only fires if the callback
        // runs somewhere other than the runtime thread.
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(250));

        token.cancel();
        task.await.unwrap();
        assert_eq!(shared.stats().delivered, 1);
    }
}
