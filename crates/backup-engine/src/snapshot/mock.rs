use core::time::Duration;
use std::{
    collections::HashSet,
    io::{self, Read, Write},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread::sleep,
};

use shared::TargetName;

use super::{
    ContentDescriptor, PortMapping, RestoreApplicator, RestoreOptions, SnapshotError,
    SnapshotProvider, TargetType, VolumeMount,
};

const VOLUME_SUFFIX: &str = "-data";

/// A target recreated by [`MockProvider`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredTarget {
    /// The name the target was restored as.
    pub name: String,
    /// The descriptor that was applied.
    pub descriptor: ContentDescriptor,
    /// The options it was restored with.
    pub options: RestoreOptions,
}

/// Mock a container engine. Every target is a container with one volume holding a fixed
/// payload.
#[derive(Debug, Default)]
pub struct MockProvider {
    payload_size: usize,
    delay: Duration,
    failing: Mutex<HashSet<String>>,
    exports: Mutex<Vec<String>>,
    imports: Mutex<Vec<(String, usize)>>,
    restored: Mutex<Vec<RestoredTarget>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockProvider {
    /// Create a provider whose volumes hold `payload_size` bytes.
    pub fn new(payload_size: usize) -> Self {
        Self {
            payload_size,
            ..Default::default()
        }
    }

    /// Take `delay` to export each volume.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make exports of `target` fail part way through.
    pub fn fail_target(&self, target: &str) {
        lock(&self.failing).insert(target.to_string());
    }

    /// Targets whose volumes were exported, in order.
    pub fn exports(&self) -> Vec<String> {
        lock(&self.exports).clone()
    }

    /// Volumes imported and the bytes each received.
    pub fn imports(&self) -> Vec<(String, usize)> {
        lock(&self.imports).clone()
    }

    /// Targets recreated so far.
    pub fn restored(&self) -> Vec<RestoredTarget> {
        lock(&self.restored).clone()
    }

    /// The most exports that ever ran at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn payload(&self) -> Vec<u8> {
        (0..self.payload_size)
            .map(|index| u8::try_from(index % 251).unwrap_or_default())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SnapshotProvider for MockProvider {
    fn describe(&self, target: &TargetName) -> Result<ContentDescriptor, SnapshotError> {
        Ok(ContentDescriptor {
            target: target.clone(),
            target_type: TargetType::Container,
            image: Some("mock:latest".to_string()),
            volumes: vec![VolumeMount {
                name: format!("{target}{VOLUME_SUFFIX}"),
                destination: "/data".to_string(),
                read_only: false,
            }],
            ports: vec![PortMapping {
                container_port: "80/tcp".to_string(),
                host_ip: String::new(),
                host_port: "8080".to_string(),
            }],
            environment: vec!["MODE=mock".to_string()],
            network: None,
        })
    }

    fn export_volume(&self, volume: &str, writer: &mut dyn Write) -> Result<(), SnapshotError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let target = volume.strip_suffix(VOLUME_SUFFIX).unwrap_or(volume).to_string();
        lock(&self.exports).push(target.clone());

        sleep(self.delay);

        let payload = self.payload();
        let result = if lock(&self.failing).contains(&target) {
            let half = payload.get(..payload.len() / 2).unwrap_or_default();
            writer
                .write_all(half)
                .map_err(|e| SnapshotError::Io(e, "write the volume"))
                .and(Err(SnapshotError::Io(
                    io::Error::other("export interrupted"),
                    "stream the volume",
                )))
        } else {
            writer
                .write_all(&payload)
                .map_err(|e| SnapshotError::Io(e, "write the volume"))
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl RestoreApplicator for MockProvider {
    fn import_volume(&self, volume: &str, reader: &mut dyn Read) -> Result<(), SnapshotError> {
        let mut contents = Vec::new();
        reader
            .read_to_end(&mut contents)
            .map_err(|e| SnapshotError::Io(e, "read the volume"))?;

        lock(&self.imports).push((volume.to_string(), contents.len()));
        Ok(())
    }

    fn apply(&self, descriptor: &ContentDescriptor, options: &RestoreOptions) -> Result<String, SnapshotError> {
        let name = options.target_name(&descriptor.target).to_string();

        lock(&self.restored).push(RestoredTarget {
            name: name.clone(),
            descriptor: descriptor.clone(),
            options: options.clone(),
        });

        Ok(name)
    }
}
