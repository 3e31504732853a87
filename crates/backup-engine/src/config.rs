//! Backup engine config
//!

use core::time::Duration;
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageConfig;

/// The queue processor's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long finished job progress is kept for polling.
    pub progress_ttl_seconds: u64,
}

impl QueueConfig {
    /// The progress retention as a duration.
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_seconds)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            progress_ttl_seconds: 60 * 10,
        }
    }
}

/// The scheduler's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the scheduler compares the clock against the next run.
    pub poll_interval_seconds: u64,

    /// How long the scheduler may go without a heartbeat before it is replaced.
    pub heartbeat_timeout_seconds: u64,

    /// How often the supervisor checks on the background tasks.
    pub supervisor_interval_seconds: u64,
}

impl SchedulerConfig {
    /// The poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    /// The heartbeat timeout as a duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds.max(1))
    }

    /// The supervisor interval as a duration.
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_seconds.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            heartbeat_timeout_seconds: 60 * 5,
            supervisor_interval_seconds: 60,
        }
    }
}

/// How the container engine is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// The docker binary.
    pub binary: String,

    /// The image used to tar and untar volume contents.
    pub helper_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            helper_image: "alpine:3".to_string(),
        }
    }
}

/// The engine's config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifies this server in artifacts written to shared stores.
    pub server_id: String,

    /// Where the database lives.
    pub data_directory: PathBuf,

    /// The vault key. Kept apart from the database.
    pub key_file: PathBuf,

    /// Where log files are written.
    pub log_directory: PathBuf,

    /// The default log level.
    pub log_level: String,

    /// Where artifacts are stored.
    pub storage: StorageConfig,

    /// The queue processor's config.
    #[serde(default)]
    pub queue: QueueConfig,

    /// The scheduler's config.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// How the container engine is reached.
    #[serde(default)]
    pub docker: DockerConfig,
}

impl Config {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: PathBuf) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }

    /// The path of the engine database.
    pub fn database_path(&self) -> PathBuf {
        self.data_directory.join("engine.sqlite3")
    }
}

impl Default for Config {
    fn default() -> Self {
        let server_id = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        Self {
            server_id,
            data_directory: PathBuf::from("./data"),
            key_file: PathBuf::from("./vault.key"),
            log_directory: PathBuf::from("./logs"),
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),
}
