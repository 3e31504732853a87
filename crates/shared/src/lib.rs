//! # Shared
//! The shared components between the backup engine, its binary and its tests.
//!

#![warn(missing_docs)]

mod certificates;
mod failure;
mod kind;
mod logger;
mod schedule;
mod sidecar;
mod target_name;

pub use certificates::{TrustStoreError, load_trust_store};
pub use failure::Failure;
pub use kind::ArtifactKind;
pub use logger::{LoggerError, init_logger};
pub use schedule::{Schedule, ScheduleError};
pub use sidecar::{ArtifactName, ArtifactNameError, SIDECAR_SUFFIX, Sidecar};
pub use target_name::{TargetName, TargetNameError};
