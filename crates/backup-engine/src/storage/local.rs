use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{ArtifactName, SIDECAR_SUFFIX, Sidecar};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{InFlight, Payload, StorageBackend, StorageError, StoredArtifact};

/// Directory inside the store where in-flight writes are staged.
const STAGING_DIRECTORY: &str = ".partial";

/// Stores artifacts as files in a directory on this host.
///
/// Writes are staged inside the same directory and renamed into place, so an artifact is
/// never visible with fewer bytes than its final size.
pub struct LocalStore {
    directory: PathBuf,
    /// Inconsistencies that have already been logged.
    reported: Mutex<HashSet<String>>,
    in_flight: InFlight,
}

impl LocalStore {
    /// Create a store in `directory`, creating it if needed.
    pub fn new(directory: PathBuf) -> Result<Self, StorageError> {
        // Check if the directory exists
        match fs::metadata(&directory) {
            Ok(metadata) => {
                if !metadata.is_dir() {
                    return Err(StorageError::Io(
                        io::Error::other(format!("{directory:?} is not a directory")),
                        "open the artifact directory",
                    ));
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&directory)
                    .map_err(|e| StorageError::Io(e, "create the artifact directory"))?;
            }
            Err(error) => return Err(StorageError::Io(error, "open the artifact directory")),
        }

        fs::create_dir_all(directory.join(STAGING_DIRECTORY))
            .map_err(|e| StorageError::Io(e, "create the staging directory"))?;

        Ok(Self {
            directory,
            reported: Mutex::new(HashSet::new()),
            in_flight: InFlight::default(),
        })
    }

    /// The artifact directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Only names that parse as artifacts are ever joined onto the directory.
    fn artifact_path(&self, name: &str) -> Result<(ArtifactName, PathBuf), StorageError> {
        let name = ArtifactName::parse(name).map_err(|_| StorageError::NotFound(name.to_string()))?;
        let path = self.directory.join(name.as_str());
        Ok((name, path))
    }

    fn sidecar_path(&self, name: &ArtifactName) -> PathBuf {
        self.directory.join(name.sidecar_name())
    }

    fn staging_path(&self, file_name: &str) -> PathBuf {
        self.directory.join(STAGING_DIRECTORY).join(file_name)
    }

    /// Log an inconsistency only the first time it is seen.
    fn report_once(&self, name: &str, message: &str) {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        if reported.insert(name.to_string()) {
            warn!("[Local Store] {name}: {message}");
        }
    }

    fn write_staged(&self, file_name: &str, reader: &mut dyn Read) -> Result<(PathBuf, u64), StorageError> {
        let path = self.staging_path(file_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::Io(e, "create the staging file"))?;

        let written = io::copy(reader, &mut file).map_err(|e| {
            let _ = fs::remove_file(&path);
            StorageError::Io(e, "write the staging file")
        })?;

        file.sync_all().map_err(|e| {
            let _ = fs::remove_file(&path);
            StorageError::Io(e, "sync the staging file")
        })?;

        Ok((path, written))
    }
}

fn modified_time(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl StorageBackend for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.directory.display())
    }

    fn put(&self, name: &ArtifactName, payload: Payload, sidecar: &Sidecar) -> Result<u64, StorageError> {
        let Payload { mut reader, len } = payload;
        let _in_flight = self.in_flight.hold(name);

        let (archive_staged, written) = self.write_staged(name.as_str(), &mut reader)?;
        if written != len {
            let _ = fs::remove_file(&archive_staged);
            return Err(StorageError::Consistency(
                name.to_string(),
                format!("wrote {written} bytes, expected {len}"),
            ));
        }

        let sidecar_bytes = sidecar.to_bytes()?;
        let (sidecar_staged, _) = self
            .write_staged(&name.sidecar_name(), &mut sidecar_bytes.as_slice())
            .inspect_err(|_| {
                let _ = fs::remove_file(&archive_staged);
            })?;

        // The archive is moved into place before its sidecar; listings skip the name until both
        // are there.
        let archive_path = self.directory.join(name.as_str());
        if let Err(error) = fs::rename(&archive_staged, &archive_path) {
            let _ = fs::remove_file(&archive_staged);
            let _ = fs::remove_file(&sidecar_staged);
            return Err(StorageError::Io(error, "move the archive into place"));
        }

        if let Err(error) = fs::rename(&sidecar_staged, self.sidecar_path(name)) {
            let _ = fs::remove_file(&archive_path);
            let _ = fs::remove_file(&sidecar_staged);
            return Err(StorageError::Io(error, "move the sidecar into place"));
        }

        debug!("[Local Store] Stored {name} ({written} bytes)");

        Ok(written)
    }

    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let (_, path) = self.artifact_path(name)?;

        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(error) => Err(StorageError::Io(error, "open the artifact")),
        }
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        let (_, path) = self.artifact_path(name)?;

        match fs::metadata(&path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(error) => Err(StorageError::Io(error, "read the artifact metadata")),
        }
    }

    fn list(&self) -> Result<Vec<StoredArtifact>, StorageError> {
        let directory = fs::read_dir(&self.directory)
            .map_err(|e| StorageError::Io(e, "read the artifact directory"))?;

        let mut archives: HashMap<String, fs::Metadata> = HashMap::new();
        let mut sidecars: HashSet<String> = HashSet::new();

        for entry in directory {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("[Local Store] Could not read entry: {error}");
                    continue;
                }
            };

            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("[Local Store] Could not get entry '{file_name}' metadata: {error}");
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            // Only sidecars of valid artifact names are ours; other json files are left alone.
            if let Some(archive) = ArtifactName::of_sidecar(&file_name) {
                if !self.in_flight.contains(archive.as_str()) {
                    sidecars.insert(archive.as_str().to_string());
                }
            } else if ArtifactName::is_archive(&file_name) && !self.in_flight.contains(&file_name) {
                archives.insert(file_name, metadata);
            }
        }

        // Sidecars whose archive is gone are left over from an interrupted delete.
        for orphan in sidecars.iter().filter(|name| !archives.contains_key(*name)) {
            self.report_once(orphan, "sidecar has no archive, removing it");
            let path = self.directory.join(format!("{orphan}{SIDECAR_SUFFIX}"));
            if let Err(error) = fs::remove_file(&path) {
                if error.kind() != ErrorKind::NotFound {
                    warn!("[Local Store] Could not remove orphaned sidecar {path:?}: {error}");
                }
            }
        }

        let mut artifacts = Vec::with_capacity(archives.len());
        for (file_name, metadata) in archives {
            let name = match ArtifactName::parse(&file_name) {
                Ok(name) => name,
                Err(error) => {
                    self.report_once(&file_name, &format!("not an artifact name: {error}"));
                    continue;
                }
            };

            let sidecar = if sidecars.contains(&file_name) {
                let parsed = fs::read(self.sidecar_path(&name))
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| Sidecar::from_bytes(&bytes).map_err(|e| e.to_string()));

                if let Err(error) = &parsed {
                    self.report_once(&file_name, &format!("sidecar is unreadable: {error}"));
                }
                Some(parsed)
            } else {
                self.report_once(&file_name, "archive has no sidecar");
                None
            };

            artifacts.push(StoredArtifact::from_parts(
                name,
                metadata.len(),
                modified_time(&metadata),
                sidecar,
            ));
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(artifacts)
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        let (name, path) = self.artifact_path(name)?;

        let archive_removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(error) if error.kind() == ErrorKind::NotFound => false,
            Err(error) => return Err(StorageError::Io(error, "delete the artifact")),
        };

        let sidecar_removed = match fs::remove_file(self.sidecar_path(&name)) {
            Ok(()) => true,
            Err(error) if error.kind() == ErrorKind::NotFound => false,
            Err(error) => {
                // The next listing removes the orphan.
                warn!("[Local Store] Deleted {name} but not its sidecar: {error}");
                true
            }
        };

        if !archive_removed && !sidecar_removed {
            return Err(StorageError::NotFound(name.to_string()));
        }

        Ok(())
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        let probe_name = format!("connection-test-{}", Uuid::new_v4());
        let probe = probe_name.as_bytes();

        let (path, _) = self.write_staged(&probe_name, &mut &*probe)?;

        let read_back = fs::read(&path);
        let _ = fs::remove_file(&path);

        let read_back = read_back.map_err(|e| StorageError::Io(e, "read the connection probe"))?;
        if read_back != probe {
            return Err(StorageError::Consistency(
                probe_name,
                "connection probe did not read back".to_string(),
            ));
        }

        Ok(())
    }
}
