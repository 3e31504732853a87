//! Performs one backup or restore.
//!
//! A backup is spooled to a temporary file first: the archive is a gzip compressed tar holding
//! `descriptor.json` followed by one `volumes/<volume>.tar` entry per volume. Only once the
//! spool is complete is it handed to the storage backend, with its exact length.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use shared::{ArtifactKind, ArtifactName, Sidecar, TargetName};
use tar::{Archive, Builder, Header};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    Context,
    error::{Classify, ErrorClass},
    snapshot::{ContentDescriptor, RestoreApplicator, RestoreOptions, SnapshotError, SnapshotProvider},
    storage::{Payload, StorageBackend, StorageError},
};

const DESCRIPTOR_ENTRY: &str = "descriptor.json";
const VOLUME_DIRECTORY: &str = "volumes/";
const VOLUME_EXTENSION: &str = ".tar";

/// A backup to perform.
pub struct BackupRequest<'a> {
    /// The target to back up.
    pub target: &'a TargetName,
    /// Manual or scheduled.
    pub kind: ArtifactKind,
    /// The name to store the artifact under.
    pub name: &'a ArtifactName,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
}

/// Runs backups and restores against a snapshot provider.
pub struct Executor {
    provider: Arc<dyn SnapshotProvider>,
    applicator: Arc<dyn RestoreApplicator>,
    server_id: String,
}

impl Executor {
    /// Create an executor writing `server_id` into every sidecar.
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        applicator: Arc<dyn RestoreApplicator>,
        server_id: String,
    ) -> Self {
        Self {
            provider,
            applicator,
            server_id,
        }
    }

    /// Back up a target and store the archive, returning the bytes the backend reported
    /// writing.
    pub fn backup(
        &self,
        context: &mut Context,
        storage: &dyn StorageBackend,
        request: &BackupRequest<'_>,
        progress: &dyn Fn(String),
    ) -> Result<u64, ExecutorError> {
        context.current_context = "Describe";
        let descriptor = self.provider.describe(request.target)?;
        debug!(
            "{context}{} volume(s), {} port mapping(s)",
            descriptor.volumes.len(),
            descriptor.ports.len()
        );

        context.current_context = "Archive";
        let mut spool = self.write_archive(context, &descriptor, progress)?;

        let len = spool
            .metadata()
            .map_err(|e| ExecutorError::Archive(e, "read the archive size"))?
            .len();
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|e| ExecutorError::Archive(e, "rewind the archive"))?;

        let sidecar = Sidecar {
            server_id: self.server_id.clone(),
            kind: request.kind,
            created_at: request.created_at,
            target: request.target.clone(),
            size: len,
            descriptor: Some(serde_json::to_value(&descriptor).map_err(ExecutorError::Descriptor)?),
        };

        context.current_context = "Store";
        progress(format!("Storing {len} bytes"));
        let written = storage.put(
            request.name,
            Payload {
                reader: Box::new(spool),
                len,
            },
            &sidecar,
        )?;

        info!("{context}Stored {} ({written} bytes) in {}", request.name, storage.describe());

        Ok(written)
    }

    fn write_archive(
        &self,
        context: &Context,
        descriptor: &ContentDescriptor,
        progress: &dyn Fn(String),
    ) -> Result<File, ExecutorError> {
        let spool = tempfile::tempfile().map_err(|e| ExecutorError::Archive(e, "create the spool file"))?;
        let mut builder = Builder::new(GzEncoder::new(spool, Compression::default()));

        let descriptor_bytes = serde_json::to_vec_pretty(descriptor).map_err(ExecutorError::Descriptor)?;
        let mut header = entry_header(u64::try_from(descriptor_bytes.len()).unwrap_or(u64::MAX));
        builder
            .append_data(&mut header, DESCRIPTOR_ENTRY, descriptor_bytes.as_slice())
            .map_err(|e| ExecutorError::Archive(e, "write the descriptor"))?;

        let total = descriptor.volumes.len();
        for (index, volume) in descriptor.volumes.iter().enumerate() {
            progress(format!("Exporting volume {} of {total}: {}", index + 1, volume.name));
            debug!("{context}Exporting volume {}", volume.name);

            let mut volume_spool =
                tempfile::tempfile().map_err(|e| ExecutorError::Archive(e, "create the volume spool"))?;
            self.provider.export_volume(&volume.name, &mut volume_spool)?;

            let volume_len = volume_spool
                .seek(SeekFrom::End(0))
                .map_err(|e| ExecutorError::Archive(e, "read the volume size"))?;
            volume_spool
                .seek(SeekFrom::Start(0))
                .map_err(|e| ExecutorError::Archive(e, "rewind the volume"))?;

            let mut header = entry_header(volume_len);
            let path = format!("{VOLUME_DIRECTORY}{}{VOLUME_EXTENSION}", volume.name);
            builder
                .append_data(&mut header, path, volume_spool)
                .map_err(|e| ExecutorError::Archive(e, "append the volume"))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| ExecutorError::Archive(e, "finish the archive"))?;
        let spool = encoder
            .finish()
            .map_err(|e| ExecutorError::Archive(e, "finish compressing the archive"))?;
        spool
            .sync_all()
            .map_err(|e| ExecutorError::Archive(e, "sync the spool file"))?;

        Ok(spool)
    }

    /// Restore an artifact, returning the name the target was restored as.
    pub fn restore(
        &self,
        context: &mut Context,
        storage: &dyn StorageBackend,
        artifact: &str,
        options: &RestoreOptions,
        progress: &dyn Fn(String),
    ) -> Result<String, ExecutorError> {
        context.current_context = "Fetch";
        let reader = storage.get(artifact)?;

        context.current_context = "Unpack";
        let mut archive = Archive::new(GzDecoder::new(reader));
        let mut descriptor: Option<ContentDescriptor> = None;

        let entries = archive
            .entries()
            .map_err(|e| ExecutorError::Archive(e, "read the archive"))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| ExecutorError::Archive(e, "read an archive entry"))?;
            let path = entry
                .path()
                .map_err(|e| ExecutorError::Archive(e, "read an entry path"))?
                .to_string_lossy()
                .to_string();

            if path == DESCRIPTOR_ENTRY {
                let mut bytes = Vec::new();
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| ExecutorError::Archive(e, "read the descriptor"))?;
                descriptor = Some(serde_json::from_slice(&bytes).map_err(ExecutorError::Descriptor)?);
                continue;
            }

            let Some(volume) = path
                .strip_prefix(VOLUME_DIRECTORY)
                .and_then(|file| file.strip_suffix(VOLUME_EXTENSION))
            else {
                debug!("{context}Skipping unknown entry {path}");
                continue;
            };

            // The descriptor is written first, so volumes can be checked against it.
            let Some(known) = &descriptor else {
                return Err(ExecutorError::MissingDescriptor(artifact.to_string()));
            };
            if !known.volumes.iter().any(|mount| mount.name == volume) {
                return Err(ExecutorError::UnknownVolume(artifact.to_string(), volume.to_string()));
            }

            let destination = options.volume_name(volume).to_string();
            progress(format!("Importing volume {destination}"));
            self.applicator.import_volume(&destination, &mut entry)?;
        }

        let descriptor = descriptor.ok_or_else(|| ExecutorError::MissingDescriptor(artifact.to_string()))?;

        context.current_context = "Apply";
        progress(format!("Recreating {}", descriptor.target));
        let restored = self.applicator.apply(&descriptor, options)?;

        info!("{context}Restored {artifact} as {restored}");

        Ok(restored)
    }
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(Utc::now().timestamp()).unwrap_or_default());
    header.set_cksum();
    header
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to snapshot the target:\n{0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Failed to access storage:\n{0}")]
    Storage(#[from] StorageError),

    #[error("Failed to {1}:\n{0}")]
    Archive(#[source] io::Error, &'static str),

    #[error("Failed to (de)serialize the descriptor:\n{0}")]
    Descriptor(#[source] serde_json::Error),

    #[error("Artifact '{0}' has no descriptor")]
    MissingDescriptor(String),

    #[error("Artifact '{0}' holds volume '{1}' which its descriptor does not list")]
    UnknownVolume(String, String),
}

impl Classify for ExecutorError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Snapshot(error) => error.class(),
            Self::Storage(error) => error.class(),
            Self::Archive(..) => ErrorClass::Io,
            Self::Descriptor(_)
            | Self::MissingDescriptor(_)
            | Self::UnknownVolume(..) => ErrorClass::Consistency,
        }
    }
}
