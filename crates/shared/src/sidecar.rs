use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtifactKind, TargetName, TargetNameError};

/// The extension every artifact archive carries.
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// The suffix appended to an artifact name to locate its sidecar.
pub const SIDECAR_SUFFIX: &str = ".json";

/// Small JSON document stored next to each artifact so listing never has to
/// open the archive.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// The server that wrote the artifact.
    pub server_id: String,

    /// Manual or scheduled.
    pub kind: ArtifactKind,

    /// When the backup was taken.
    pub created_at: DateTime<Utc>,

    /// The backed up target.
    pub target: TargetName,

    /// Archive size in bytes.
    #[serde(default)]
    pub size: u64,

    /// Summary of the archive contents.
    #[serde(default)]
    pub descriptor: Option<serde_json::Value>,
}

impl Sidecar {
    /// Serialize the sidecar to its stored form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse a stored sidecar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The unique name of an artifact within a storage backend:
/// `<target>.<%Y%m%dT%H%M%S%3fZ>.tar.gz`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactName {
    name: String,
    target: TargetName,
}

impl ArtifactName {
    /// Create an artifact name for a target at a point in time.
    pub fn new(target: &TargetName, created_at: DateTime<Utc>) -> Self {
        let name = format!(
            "{target}.{}{ARCHIVE_SUFFIX}",
            created_at.format("%Y%m%dT%H%M%S%3fZ")
        );

        Self {
            name,
            target: target.clone(),
        }
    }

    /// The name one millisecond later, used to step past a collision.
    pub fn next_after(&self, created_at: DateTime<Utc>) -> (Self, DateTime<Utc>) {
        let created_at = created_at + TimeDelta::milliseconds(1);
        (Self::new(&self.target, created_at), created_at)
    }

    /// Parse a stored artifact name.
    pub fn parse(name: &str) -> Result<Self, ArtifactNameError> {
        let stem = name
            .strip_suffix(ARCHIVE_SUFFIX)
            .ok_or_else(|| ArtifactNameError::Extension(name.to_string()))?;

        let (target, stamp) = stem
            .rsplit_once('.')
            .ok_or_else(|| ArtifactNameError::Timestamp(name.to_string()))?;

        if stamp.len() != 19 || !stamp.ends_with('Z') {
            return Err(ArtifactNameError::Timestamp(name.to_string()));
        }

        let target = TargetName::try_from(target)?;

        Ok(Self {
            name: name.to_string(),
            target,
        })
    }

    /// If a stored object name looks like an artifact archive.
    pub fn is_archive(name: &str) -> bool {
        name.ends_with(ARCHIVE_SUFFIX)
    }

    /// The artifact a sidecar belongs to. `None` when `name` is not the sidecar of a valid
    /// artifact name.
    pub fn of_sidecar(name: &str) -> Option<Self> {
        name.strip_suffix(SIDECAR_SUFFIX)
            .and_then(|archive| Self::parse(archive).ok())
    }

    /// The stored name of the artifact.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The target the artifact belongs to.
    pub fn target(&self) -> &TargetName {
        &self.target
    }

    /// The stored name of this artifact's sidecar.
    pub fn sidecar_name(&self) -> String {
        format!("{}{SIDECAR_SUFFIX}", self.name)
    }
}

impl core::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ArtifactNameError {
    #[error("Artifact '{0}' does not end in {ARCHIVE_SUFFIX}")]
    Extension(String),

    #[error("Artifact '{0}' does not carry a valid timestamp")]
    Timestamp(String),

    #[error("Artifact target is invalid: {0}")]
    Target(#[from] TargetNameError),
}
