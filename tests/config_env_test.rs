use confwatch::{Backend, WatcherConfig};
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_env_override_with_nested_keys() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("confwatch.toml");
    fs::write(
        &config_path,
        r#"
reconcile_interval_ms = 5000
event_buffer = 64

[logging]
default = "info"
"#,
    )
    .unwrap();

    unsafe {
        // Single underscore stays inside a field name, double underscore nests
        env::set_var("CONFWATCH_RECONCILE_INTERVAL_MS", "250");
        env::set_var("CONFWATCH_BACKEND", "poll");
        env::set_var("CONFWATCH_LOGGING__DEFAULT", "debug");
    }

    let config = WatcherConfig::load_from(&config_path);

    unsafe {
        env::remove_var("CONFWATCH_RECONCILE_INTERVAL_MS");
        env::remove_var("CONFWATCH_BACKEND");
        env::remove_var("CONFWATCH_LOGGING__DEFAULT");
    }

    let config = config.unwrap();
    // Environment wins over the file
    assert_eq!(config.reconcile_interval(), Duration::from_millis(250));
    assert_eq!(config.backend, Backend::Poll);
    assert_eq!(config.logging.default, "debug");
    // File wins over defaults
    assert_eq!(config.event_buffer, 64);
    // Defaults fill the rest
    assert_eq!(config.poll_interval(), Duration::from_secs(2));
}
