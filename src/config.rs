//! Configuration for the watcher.
//!
//! Layered the usual way:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CONFWATCH_` and use double
//! underscores to separate nested levels:
//! - `CONFWATCH_RECONCILE_INTERVAL_MS=500` sets `reconcile_interval_ms`
//! - `CONFWATCH_BACKEND=poll` sets `backend`
//! - `CONFWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::watcher::WatchError;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "confwatch.toml";

const ENV_PREFIX: &str = "CONFWATCH_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Reconcile period in milliseconds. Also the debounce window.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Notification backend
    #[serde(default)]
    pub backend: Backend,

    /// Poll period in milliseconds, only used by the poll backend
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the raw event channel between the backend and the dispatcher
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which notify watcher feeds the dispatcher.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// inotify, FSEvents, kqueue or ReadDirectoryChanges.
    #[default]
    Native,
    /// Periodic directory scans, for network and container filesystems.
    Poll,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Level for everything without a module override
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `confwatch = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_reconcile_interval_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_event_buffer() -> usize {
    256
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            backend: Backend::default(),
            poll_interval_ms: default_poll_interval_ms(),
            event_buffer: default_event_buffer(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatcherConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] if present, plus environment.
    pub fn load() -> Result<Self, WatchError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file. A missing file leaves the
    /// defaults in place.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let config: Self = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(WatcherConfig::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscore
            // stays within field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Reject values the watcher cannot run with.
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.reconcile_interval_ms == 0 {
            return Err(invalid("reconcile_interval_ms must be greater than zero"));
        }
        if self.backend == Backend::Poll && self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer must be greater than zero"));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn invalid(reason: &str) -> WatchError {
    WatchError::InvalidConfig {
        reason: reason.to_string(),
    }
}
