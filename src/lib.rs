//! Hot-reload notifications for configuration files and directories.
//!
//! ```no_run
//! use confwatch::ConfigWatcher;
//!
//! # async fn run() -> Result<(), confwatch::WatchError> {
//! let watcher = ConfigWatcher::new(|event| {
//!     println!("reload {}", event.path.display());
//!     Ok(())
//! })?;
//! watcher.add("/etc/agent/agent.hcl")?;
//! watcher.add("/etc/agent/conf.d")?;
//! watcher.start()?;
//! // ...
//! watcher.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod watcher;

pub use config::{Backend, LoggingConfig, WatcherConfig};
pub use watcher::{ConfigWatcher, TargetKind, WatchError, WatchedTarget, WatcherEvent, WatcherStats};
