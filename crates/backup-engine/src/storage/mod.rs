//! Where artifacts are persisted.
//!
//! Callers only ever hold an `Arc<dyn StorageBackend>`; the concrete backend is chosen once
//! from [`StorageConfig`] by [`open_backend`].

use core::time::Duration;
use std::{
    collections::HashSet,
    io::{self, Read},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{ArtifactKind, ArtifactName, Sidecar, TargetName};
use thiserror::Error;

use crate::{
    credentials::RemoteCredentials,
    error::{Classify, ErrorClass},
};

mod local;
mod remote;
mod sigv4;

pub use local::LocalStore;
pub use remote::RemoteStore;

/// The bytes of an artifact and their exact length.
pub struct Payload {
    /// The reader to read the artifact from.
    pub reader: Box<dyn Read + Send>,
    /// The number of bytes the reader will yield.
    pub len: u64,
}

/// How well an artifact and its sidecar agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Consistency {
    /// The archive and its sidecar are both present.
    Consistent,
    /// The archive has no sidecar.
    MissingSidecar,
    /// The sidecar could not be read or parsed.
    UnreadableSidecar,
}

/// An artifact as reported by a listing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    /// The stored name.
    pub name: String,
    /// The target, recovered from the name.
    pub target: TargetName,
    /// Size of the archive as stored.
    pub size: u64,
    /// When the backup was taken, or the object time when the sidecar is unusable.
    pub created_at: DateTime<Utc>,
    /// `None` when the sidecar is unusable.
    pub kind: Option<ArtifactKind>,
    /// `None` when the sidecar is unusable.
    pub server_id: Option<String>,
    /// Summary of the archive contents.
    pub descriptor: Option<serde_json::Value>,
    /// Whether the sidecar could be used.
    pub consistency: Consistency,
}

impl StoredArtifact {
    /// Build a listing entry from the archive's stored facts and its sidecar, if it has one.
    pub(crate) fn from_parts(
        name: ArtifactName,
        size: u64,
        modified: DateTime<Utc>,
        sidecar: Option<Result<Sidecar, String>>,
    ) -> Self {
        let target = name.target().clone();
        let name = name.as_str().to_string();

        match sidecar {
            Some(Ok(sidecar)) => Self {
                name,
                target,
                size,
                created_at: sidecar.created_at,
                kind: Some(sidecar.kind),
                server_id: Some(sidecar.server_id),
                descriptor: sidecar.descriptor,
                consistency: Consistency::Consistent,
            },
            Some(Err(_)) => Self {
                name,
                target,
                size,
                created_at: modified,
                kind: None,
                server_id: None,
                descriptor: None,
                consistency: Consistency::UnreadableSidecar,
            },
            None => Self {
                name,
                target,
                size,
                created_at: modified,
                kind: None,
                server_id: None,
                descriptor: None,
                consistency: Consistency::MissingSidecar,
            },
        }
    }
}

/// Artifact names that are still being written. Listings skip them, so a half written
/// artifact is never reported or healed.
#[derive(Debug, Default)]
pub struct InFlight {
    names: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Mark `name` as in flight until the guard is dropped.
    pub fn hold(&self, name: &ArtifactName) -> InFlightGuard<'_> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.insert(name.as_str().to_string());

        InFlightGuard {
            in_flight: self,
            name: name.as_str().to_string(),
        }
    }

    /// If `name` is being written.
    pub fn contains(&self, name: &str) -> bool {
        let names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.contains(name)
    }
}

/// Keeps a name in flight while alive.
#[must_use]
pub struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut names = self.in_flight.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.remove(&self.name);
    }
}

/// Narrows a listing. Every field is optional and fields combine with AND.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ArtifactFilter {
    /// Only this target.
    pub target: Option<TargetName>,
    /// Only this kind. Artifacts of unknown kind never match.
    pub kind: Option<ArtifactKind>,
    /// Only artifacts written by this server.
    pub server_id: Option<String>,
}

impl ArtifactFilter {
    /// If `artifact` passes the filter.
    pub fn matches(&self, artifact: &StoredArtifact) -> bool {
        self.target.as_ref().is_none_or(|target| artifact.target == *target)
            && self.kind.is_none_or(|kind| artifact.kind == Some(kind))
            && self
                .server_id
                .as_deref()
                .is_none_or(|server_id| artifact.server_id.as_deref() == Some(server_id))
    }
}

/// The uniform contract every storage destination implements.
pub trait StorageBackend: Send + Sync {
    /// A short human readable description for logs.
    fn describe(&self) -> String;

    /// Atomically store an artifact and its sidecar, returning the bytes written.
    ///
    /// A reader never observes `name` with fewer bytes than the final size.
    fn put(&self, name: &ArtifactName, payload: Payload, sidecar: &Sidecar) -> Result<u64, StorageError>;

    /// Open an artifact for reading.
    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>, StorageError>;

    /// The stored size of an artifact, as reported by the backend itself.
    fn size(&self, name: &str) -> Result<u64, StorageError>;

    /// List every artifact using the sidecars. Never opens an archive.
    fn list(&self) -> Result<Vec<StoredArtifact>, StorageError>;

    /// Delete an artifact and its sidecar together.
    fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Run a harmless write, read and delete round trip.
    fn test_connection(&self) -> Result<(), StorageError>;

    /// If an artifact with this name is stored.
    fn exists(&self, name: &str) -> Result<bool, StorageError> {
        match self.size(name) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Options for the remote object store. The location and keys are stored encrypted in the
/// database, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOptions {
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: String,

    /// PEM file of extra root certificates for a privately signed endpoint.
    #[serde(default)]
    pub root_certificate_file: Option<PathBuf>,

    /// Timeout for a single request in seconds.
    pub timeout_seconds: u64,
}

impl RemoteOptions {
    /// The request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            root_certificate_file: None,
            timeout_seconds: 60 * 30,
        }
    }
}

/// Which backend new artifacts are written to and listings query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StorageConfig {
    /// A directory on this host.
    Local {
        /// The artifact directory.
        directory: PathBuf,
    },

    /// An S3 compatible object store.
    Remote(RemoteOptions),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            directory: PathBuf::from("./backups"),
        }
    }
}

/// Open the backend described by `config`.
pub fn open_backend(
    config: &StorageConfig,
    credentials: Option<RemoteCredentials>,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config {
        StorageConfig::Local { directory } => Ok(Arc::new(LocalStore::new(directory.clone())?)),
        StorageConfig::Remote(options) => {
            let credentials = credentials.ok_or_else(|| {
                StorageError::Auth("no remote credentials are stored".to_string())
            })?;
            Ok(Arc::new(RemoteStore::new(options.clone(), credentials)?))
        }
    }
}

/// The active backend, replaced copy-on-write so running jobs keep the backend they started
/// with.
pub struct ActiveStorage {
    current: RwLock<(StorageConfig, Arc<dyn StorageBackend>)>,
    /// Artifacts written but not yet verified by their job.
    unverified: InFlight,
}

impl ActiveStorage {
    /// Wrap an opened backend.
    pub fn new(config: StorageConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            current: RwLock::new((config, backend)),
            unverified: InFlight::default(),
        }
    }

    /// Hide `name` from [`Self::list`] until its job has verified or discarded it.
    pub fn hold(&self, name: &ArtifactName) -> InFlightGuard<'_> {
        self.unverified.hold(name)
    }

    /// List `backend`, leaving out artifacts whose job has not finished with them.
    pub fn list(&self, backend: &dyn StorageBackend) -> Result<Vec<StoredArtifact>, StorageError> {
        let mut artifacts = backend.list()?;
        artifacts.retain(|artifact| !self.unverified.contains(&artifact.name));
        Ok(artifacts)
    }

    /// The backend new work should use.
    pub fn current(&self) -> Arc<dyn StorageBackend> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard.1)
    }

    /// The config of the active backend.
    pub fn config(&self) -> StorageConfig {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        guard.0.clone()
    }

    /// Make `backend` the active backend.
    pub fn replace(&self, config: StorageConfig, backend: Arc<dyn StorageBackend>) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = (config, backend);
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to {1}:\n{0}")]
    Io(#[source] io::Error, &'static str),

    #[error("The object store rejected the credentials: {0}")]
    Auth(String),

    #[error("Could not reach the object store: {0}")]
    Network(String),

    #[error("Artifact '{0}' was not found")]
    NotFound(String),

    #[error("Artifact '{0}' is inconsistent: {1}")]
    Consistency(String, String),

    #[error("The object store returned {0}: {1}")]
    Remote(u16, String),

    #[error("Failed to (de)serialize a sidecar:\n{0}")]
    Sidecar(#[from] serde_json::Error),

    #[error("Failed to configure the object store client: {0}")]
    Client(String),
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) => ErrorClass::Auth,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Consistency(..) | Self::Sidecar(_) => ErrorClass::Consistency,
            Self::Io(..) | Self::Network(_) | Self::Remote(..) | Self::Client(_) => ErrorClass::Io,
        }
    }
}
