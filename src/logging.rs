//! Logging setup for applications embedding the watcher.
//!
//! The library only emits `tracing` events; nothing is printed until the
//! host installs a subscriber. [`init_with_config`] installs a compact one
//! driven by the `[logging]` section of the watcher configuration.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "warn"      # quiet by default
//!
//! [logging.modules]
//! confwatch = "debug"   # show every raw event decision
//! ```
//!
//! # Environment Variable
//!
//! `RUST_LOG` takes precedence over config:
//! ```bash
//! RUST_LOG=confwatch=debug my-agent
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Build an `EnvFilter` directive string from config.
///
/// Module overrides are emitted in sorted order so the result is stable.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();

    let mut directives = config.default.clone();
    for (module, level) in modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

/// Install the global subscriber.
///
/// Only the first call takes effect, and it does nothing if the host has
/// already installed a subscriber of its own.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(CompactTime)
            .with_level(true)
            .with_filter(filter);

        if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
            tracing::debug!("[logging] subscriber already installed");
        }
    });
}

/// Install the global subscriber with `default = "warn"`.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Log an event with component context.
///
/// # Examples
/// ```ignore
/// log_event!("watcher", "added", "{}", path.display());
/// log_event!("watcher", "closed");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug-only event logging.
///
/// # Examples
/// ```ignore
/// debug_event!("dispatch", "ignored", "{:?} {}", op, path.display());
/// ```
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let mut config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "warn");

        config.modules.insert("tokio".to_string(), "error".to_string());
        config
            .modules
            .insert("confwatch".to_string(), "debug".to_string());
        assert_eq!(
            filter_directives(&config),
            "warn,confwatch=debug,tokio=error"
        );
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init();
        init_with_config(&LoggingConfig::default());
        crate::debug_event!("logging", "initialized");
    }
}
