#![allow(missing_docs)]

use std::{fs, path::PathBuf};

use backup_engine::{
    Config, Engine, LoadConfigError,
    storage::{ArtifactFilter, StorageConfig},
};
use common::test_config;

mod common;

#[test]
fn default_config_round_trips_through_toml() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("config.toml");

    let config = Config::default();
    fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = Config::load_toml(path).unwrap();
    assert_eq!(loaded.server_id, config.server_id);
    assert_eq!(loaded.scheduler.poll_interval_seconds, 30);
    assert!(matches!(loaded.storage, StorageConfig::Local { .. }));
}

#[test]
fn remote_storage_carries_only_transport_options() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("config.toml");

    fs::write(
        &path,
        r#"
server_id = "node-1"
data_directory = "/var/lib/backups"
key_file = "/etc/backups/vault.key"
log_directory = "/var/log/backups"
log_level = "debug"

[storage]
kind = "Remote"
prefix = "node-1/"
timeout_seconds = 120
"#,
    )
    .unwrap();

    let config = Config::load_toml(path).unwrap();
    assert_eq!(config.server_id, "node-1");
    assert_eq!(
        config.database_path(),
        PathBuf::from("/var/lib/backups/engine.sqlite3")
    );

    let StorageConfig::Remote(options) = config.storage else {
        panic!("expected remote storage");
    };
    assert_eq!(options.prefix, "node-1/");
    assert_eq!(options.timeout_seconds, 120);
    assert_eq!(options.root_certificate_file, None);

    // Sections left out fall back to their defaults.
    assert_eq!(config.queue.progress_ttl_seconds, 600);
    assert_eq!(config.docker.binary, "docker");
}

#[test]
fn missing_and_malformed_files_are_reported() {
    let directory = tempfile::tempdir().unwrap();

    assert!(matches!(
        Config::load_toml(directory.path().join("missing.toml")),
        Err(LoadConfigError::NoFile)
    ));

    let path = directory.path().join("broken.toml");
    fs::write(&path, "server_id = ").unwrap();
    assert!(matches!(
        Config::load_toml(path),
        Err(LoadConfigError::Deserialize(_))
    ));
}

#[test]
fn engine_opens_everything_the_config_names() {
    let directory = tempfile::tempdir().unwrap();

    let engine = Engine::new(test_config(directory.path())).unwrap();
    assert!(engine.list_artifacts(&ArtifactFilter::default()).unwrap().is_empty());

    assert!(directory.path().join("data").join("engine.sqlite3").exists());
    assert!(directory.path().join("vault.key").exists());
    assert!(directory.path().join("artifacts").is_dir());
}
