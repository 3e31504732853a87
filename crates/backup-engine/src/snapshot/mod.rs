//! The container engine side of a backup: describing a target, streaming its volumes out and
//! recreating it on restore.
//!

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
};

use serde::{Deserialize, Serialize};
use shared::TargetName;
use thiserror::Error;

use crate::error::{Classify, ErrorClass};

mod docker;
mod mock;

pub use docker::DockerCli;
pub use mock::{MockProvider, RestoredTarget};

/// What kind of object a target is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// A container and its named volumes.
    Container,
    /// A network definition. Has no volume content.
    Network,
}

/// A named volume mounted into a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// The volume name.
    pub name: String,
    /// Where the volume is mounted in the container.
    pub destination: String,
    /// If the mount is read only.
    #[serde(default)]
    pub read_only: bool,
}

/// A published container port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// The container port and protocol, such as `80/tcp`.
    pub container_port: String,
    /// The host address the port is bound to. Empty binds every address.
    #[serde(default)]
    pub host_ip: String,
    /// The host port.
    pub host_port: String,
}

/// The network settings of a network target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    /// The network driver.
    pub driver: String,
    /// Configured subnets.
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Everything needed to recreate a target, apart from its volume content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    /// The target this describes.
    pub target: TargetName,

    /// Container or network.
    pub target_type: TargetType,

    /// The container image.
    #[serde(default)]
    pub image: Option<String>,

    /// Named volumes, exported into the archive.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// `KEY=value` environment entries.
    #[serde(default)]
    pub environment: Vec<String>,

    /// Network settings for network targets.
    #[serde(default)]
    pub network: Option<NetworkSettings>,
}

/// Choices made by the caller when restoring. Passed to the [`RestoreApplicator`] unexamined.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOptions {
    /// Restore under a different name.
    #[serde(default)]
    pub name_override: Option<String>,

    /// Container port to replacement host port.
    #[serde(default)]
    pub port_overrides: BTreeMap<String, String>,

    /// Original volume name to replacement volume name.
    #[serde(default)]
    pub volume_overrides: BTreeMap<String, String>,

    /// Start the container once it is created.
    #[serde(default)]
    pub start: bool,
}

impl RestoreOptions {
    /// The volume `original` is restored into.
    pub fn volume_name<'a>(&'a self, original: &'a str) -> &'a str {
        self.volume_overrides
            .get(original)
            .map_or(original, String::as_str)
    }

    /// The name the target is restored as.
    pub fn target_name<'a>(&'a self, original: &'a TargetName) -> &'a str {
        self.name_override.as_deref().unwrap_or(original.as_str())
    }
}

/// Produces the descriptor and volume content of a target.
pub trait SnapshotProvider: Send + Sync {
    /// Describe the target.
    fn describe(&self, target: &TargetName) -> Result<ContentDescriptor, SnapshotError>;

    /// Stream the content of a volume as a tar archive.
    fn export_volume(&self, volume: &str, writer: &mut dyn Write) -> Result<(), SnapshotError>;
}

/// Recreates a target from its descriptor and volume content.
pub trait RestoreApplicator: Send + Sync {
    /// Create `volume` if needed and fill it from a tar stream.
    fn import_volume(&self, volume: &str, reader: &mut dyn Read) -> Result<(), SnapshotError>;

    /// Recreate the target, returning the name it was restored as.
    fn apply(&self, descriptor: &ContentDescriptor, options: &RestoreOptions) -> Result<String, SnapshotError>;
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to run command:\n{0}")]
    RunCommand(#[source] io::Error),

    #[error("Command output was error:\n{0}")]
    CommandErrored(String),

    #[error("Failed to {1}:\n{0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to parse the inspect output:\n{0}")]
    Inspect(#[from] serde_json::Error),

    #[error("Target '{0}' was not found")]
    NotFound(String),

    #[error("Target '{0}' could not be described: {1}")]
    Describe(String, String),
}

impl Classify for SnapshotError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Inspect(_) | Self::Describe(..) => ErrorClass::Consistency,
            Self::RunCommand(_) | Self::CommandErrored(_) | Self::Io(..) => ErrorClass::Io,
        }
    }
}
