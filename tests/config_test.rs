//! Configuration loading: file, environment overrides and validation.

use isp_core::config::CoreConfig;
use isp_core::logging::{self, LoggingConfig};
use isp_core::IspError;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(
        r#"
        [application]
        name = "bench-rig"
        log_level = "debug"
        log_format = "json"

        [watchdog]
        timeout_ms = 500
        max_consecutive_timeouts = 5

        [queue]
        frames_per_queue = 8
        max_wait_done = 2

        [aeb]
        enabled = false
        "#,
    );

    let config = CoreConfig::load_from(file.path()).expect("Failed to load config");
    assert_eq!(config.application.name, "bench-rig");
    assert_eq!(config.application.log_format, "json");
    assert_eq!(config.watchdog.timeout(), Duration::from_millis(500));
    assert_eq!(config.watchdog.max_consecutive_timeouts, 5);
    assert_eq!(config.queue.frames_per_queue, 8);
    assert_eq!(config.queue.max_wait_done, 2);
    assert!(!config.aeb.enabled);
    // untouched sections keep their defaults
    assert_eq!(config.lock, CoreConfig::default().lock);
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = CoreConfig::load_from(dir.path().join("absent.toml")).expect("Failed to load config");
    assert_eq!(config, CoreConfig::default());
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
        [watchdog]
        timeout_ms = 500
        "#,
    );

    std::env::set_var("ISP_CORE_WATCHDOG__TIMEOUT_MS", "750");
    let loaded = CoreConfig::load_from(file.path());
    std::env::remove_var("ISP_CORE_WATCHDOG__TIMEOUT_MS");

    let config = loaded.expect("Failed to load config");
    assert_eq!(config.watchdog.timeout_ms, 750);
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    let file = write_config(
        r#"
        [queue]
        frames_per_queue = 4
        max_wait_done = 4
        "#,
    );
    let err = CoreConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, IspError::Configuration(_)));
    assert!(err.to_string().contains("max_wait_done"));
}

#[test]
#[serial]
fn test_malformed_toml_rejected() {
    let file = write_config("[watchdog\ntimeout_ms = ");
    let err = CoreConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, IspError::Config(_)));
}

#[test]
#[serial]
fn test_wrong_type_rejected() {
    let file = write_config(
        r#"
        [watchdog]
        timeout_ms = "soon"
        "#,
    );
    assert!(CoreConfig::load_from(file.path()).is_err());
}

#[test]
fn test_config_renders_back_to_toml() {
    let config = CoreConfig::default();
    let rendered = config.to_toml_string().expect("Failed to render config");
    assert!(rendered.contains("[watchdog]"));
    assert!(rendered.contains("timeout_ms = 2000"));
}

#[test]
fn test_logging_init_is_idempotent() {
    let config = LoggingConfig::default();
    // the first call may lose to a subscriber installed by another test
    let _ = logging::init(config.clone());
    assert!(logging::init(config).is_ok());
}
