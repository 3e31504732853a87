//! # backup-engine
//! Serializes backup and restore jobs into a single-flight queue, stores artifacts on a local
//! or remote backend, fires scheduled backups and prunes them under a retention policy.
//!

pub mod audit;
mod config;
mod context;
pub mod credentials;
pub mod database;
mod engine;
pub mod error;
pub mod executor;
pub mod policy;
pub mod queue;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod supervisor;
pub mod vault;

pub use config::{Config, DockerConfig, LoadConfigError, QueueConfig, SchedulerConfig};
pub use context::Context;
pub use engine::{Engine, EngineError};
pub use error::{Classify, ErrorClass};
