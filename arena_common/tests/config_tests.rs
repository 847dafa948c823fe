//! Configuration persistence tests.
//!
//! Covers file discovery fallbacks, the write-back-only-if-changed rule used
//! by the last detaching process, unknown field rejection and partial
//! updates.

use arena_common::config::{
    ConfigError, ConfigLoader, ConfigUpdate, FetchMode, ShareMode, UserConfig,
};
use std::fs;
use tempfile::TempDir;

/// A missing file yields defaults rather than an error.
#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shmarena").join("config.toml");

    let config = UserConfig::load_or_default(&path).unwrap();
    assert_eq!(config, UserConfig::default());
    assert!(matches!(
        UserConfig::load(&path),
        Err(ConfigError::FileNotFound)
    ));
}

/// `store` creates the parent directory and the written file loads back.
#[test]
fn store_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = UserConfig {
        max_segments: 64,
        max_shared_size: 4096,
        gc_enabled: false,
        thread_safety: false,
        share_mode: ShareMode::Overwrite,
        fetch_mode: FetchMode::All,
        permissions: 0o640,
        spin_timeout_ms: 250,
    };
    config.store(&path).unwrap();

    let loaded = UserConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

/// Writing back is skipped when the file already holds the same values.
#[test]
fn store_if_changed_skips_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let config = UserConfig::default();
    assert!(config.store_if_changed(&path).unwrap());
    let before = fs::metadata(&path).unwrap().modified().unwrap();

    assert!(!config.store_if_changed(&path).unwrap());
    let after = fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(before, after);

    let changed = UserConfig {
        gc_enabled: false,
        ..config
    };
    assert!(changed.store_if_changed(&path).unwrap());
    assert!(!UserConfig::load(&path).unwrap().gc_enabled);
}

/// Unknown keys are rejected so typos do not silently fall back to defaults.
#[test]
fn unknown_field_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "max_segmnets = 3\n").unwrap();

    assert!(matches!(
        UserConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

/// An out-of-range value on disk is reported, not replaced by defaults.
#[test]
fn invalid_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "max_segments = 0\n").unwrap();

    assert!(matches!(
        UserConfig::load_or_default(&path),
        Err(ConfigError::ValidationError(_))
    ));
}

/// Textual updates from the CLI parse every field.
#[test]
fn update_from_text_fields() {
    let mut update = ConfigUpdate::default();
    update.set_field("max_segments", "5").unwrap();
    update.set_field("max_shared_size", "100").unwrap();
    update.set_field("gc_enabled", "false").unwrap();
    update.set_field("thread_safety", "false").unwrap();
    update.set_field("share_mode", "overwrite").unwrap();
    update.set_field("fetch_mode", "all").unwrap();
    update.set_field("spin_timeout_ms", "10").unwrap();

    let next = update.apply(&UserConfig::default()).unwrap();
    assert_eq!(next.max_segments, 5);
    assert_eq!(next.max_shared_size, 100);
    assert!(!next.gc_enabled);
    assert!(!next.thread_safety);
    assert_eq!(next.share_mode, ShareMode::Overwrite);
    assert_eq!(next.fetch_mode, FetchMode::All);
    assert_eq!(next.spin_timeout_ms, 10);

    assert!(update.set_field("share_mode", "append").is_err());
    assert!(update.set_field("gc_enabled", "maybe").is_err());
}

/// An update that would produce an invalid block is refused as a whole.
#[test]
fn invalid_update_refused() {
    let update = ConfigUpdate {
        max_segments: Some(0),
        gc_enabled: Some(false),
        ..ConfigUpdate::default()
    };
    assert!(update.apply(&UserConfig::default()).is_err());
}
