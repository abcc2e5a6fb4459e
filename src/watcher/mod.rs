//! Hot-reload watcher for configuration files and directories.
//!
//! Reports when a registered path starts referring to a different storage
//! object: an atomic replace (write to a temp file, rename over the target),
//! a delete followed by a recreate, or a new entry in a watched directory.
//! In-place writes, chmod and reads are not changes.
//!
//! # Architecture
//!
//! ```text
//! ConfigWatcher (add / remove / start / close)
//!   - Registry        path -> (kind, identity, present)
//!   - EventSource     notify watcher on each watch directory
//!   - Debouncer       per-entry last delivered identity
//!         |
//!    +----+---------------+
//!    |                    |
//! dispatch task       reconcile task
//! (raw OS events)     (periodic re-resolve, re-arm)
//!    |                    |
//!    +------> callback <--+
//! ```
//!
//! Files are watched through their parent directory so the watch survives
//! the target's inode being replaced. The reconcile loop covers everything
//! the OS primitive misses.

mod debouncer;
mod dispatcher;
mod error;
mod handler;
mod identity;
mod lifecycle;
mod reconcile;
mod registry;
mod source;
mod state;

pub use error::WatchError;
pub use handler::WatcherEvent;
pub use identity::{FileId, ResolveError, Resolved, TargetKind, resolve};
pub use lifecycle::ConfigWatcher;
pub use registry::WatchedTarget;
pub use state::WatcherStats;
