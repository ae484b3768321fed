//! Configuration files and validation.

use std::io::Write;

use oxievict::config::{ConfigError, OxievictConfig};
use oxievict::evict::EvictionConfig;
use oxievict::Connection;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_from_path() {
    let file = write_config(
        r#"
        [cache]
        size = 67108864
        max_wait_ms = 250

        [eviction]
        dirty_target = 10.0
        dirty_trigger = 40.0
        threads_min = 2
        threads_max = 3
        walk_base = 64
        walk_incr = 16

        [tree]
        maxmempage = 1048576
        "#,
    );
    let config = OxievictConfig::load_from_path(file.path()).unwrap();
    let eviction = config.to_eviction_config().unwrap();
    assert_eq!(eviction.cache_size, 64 << 20);
    assert_eq!(eviction.cache_max_wait_ms, 250);
    assert_eq!(eviction.eviction_dirty_target, 10.0);
    assert_eq!(eviction.eviction_dirty_trigger, 40.0);
    // Update-chain limits follow the dirty ones when unset.
    assert_eq!(eviction.eviction_updates_target, 5.0);
    assert_eq!(eviction.eviction_updates_trigger, 20.0);
    // The checkpoint target is raised to the dirty target.
    assert_eq!(eviction.eviction_checkpoint_target, 10.0);
    assert_eq!((eviction.threads_min, eviction.threads_max), (2, 3));
    assert_eq!(eviction.evict_slots(), 80);
    assert_eq!(eviction.maxmempage, 1 << 20);
    assert!(config.metadata_config().unwrap().is_none());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = OxievictConfig::load_from_path(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_unknown_field_is_rejected() {
    let file = write_config(
        r#"
        [eviction]
        target = 70.0
        aggressiveness = 3
        "#,
    );
    let err = OxievictConfig::load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_absolute_trigger_converted_against_cache_size() {
    let file = write_config(
        r#"
        [cache]
        size = 1000000
        [eviction]
        target = 500000.0
        trigger = 900000.0
        "#,
    );
    let eviction = OxievictConfig::load_from_path(file.path())
        .unwrap()
        .to_eviction_config()
        .unwrap();
    assert!((eviction.eviction_target - 50.0).abs() < 1e-9);
    assert!((eviction.eviction_trigger - 90.0).abs() < 1e-9);
}

#[test]
fn test_shared_cache_needs_percentages() {
    let file = write_config(
        r#"
        [cache]
        shared = true
        [eviction]
        dirty_target = 1000000.0
        "#,
    );
    let err = OxievictConfig::load_from_path(file.path())
        .unwrap()
        .to_eviction_config()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_metadata_chunk_size_must_be_positive() {
    let file = write_config(
        r#"
        [metadata]
        path = "chunks.meta"
        chunk_size = 0
        "#,
    );
    let config = OxievictConfig::load_from_path(file.path()).unwrap();
    assert!(matches!(
        config.metadata_config(),
        Err(ConfigError::InvalidValue { .. })
    ));
}

#[test]
fn test_connection_from_config_starts_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_config(&format!(
        r#"
        [cache]
        size = 8388608
        [metadata]
        path = "{}"
        "#,
        dir.path().join("chunks.meta").display()
    ));
    let config = OxievictConfig::load_from_path(file.path()).unwrap();
    let conn = Connection::from_config(&config).unwrap();
    assert_eq!(conn.engine().config().cache_size, 8 << 20);
    assert!(conn.metadata().is_some());
    conn.close().unwrap();
    assert!(dir.path().join("chunks.meta").exists());
}

#[test]
fn test_pairs_and_validation_order() {
    let config = EvictionConfig::from_pairs(&[
        ("cache_size", "10MB"),
        ("eviction_trigger", "9MB"),
        ("eviction_target", "8MB"),
    ])
    .unwrap()
    .validated()
    .unwrap();
    assert!((config.eviction_trigger - 90.0).abs() < 1e-9);
    assert!((config.eviction_target - 80.0).abs() < 1e-9);

    let err = EvictionConfig::from_pairs(&[("eviction.walk_base", "0"), ("eviction.walk_incr", "0")])
        .unwrap()
        .validated()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}
