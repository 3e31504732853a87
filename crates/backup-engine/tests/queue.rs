#![allow(missing_docs)]

use core::time::Duration;
use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    sync::{Arc, Barrier},
    thread,
};

use backup_engine::{
    ErrorClass,
    audit::{AuditFilter, AuditLog, AuditStatus, Operation},
    database::Database,
    executor::Executor,
    queue::{CancelError, JobRequest, JobState, JobTable, Next, Progress, QueueProcessor},
    snapshot::{MockProvider, RestoreOptions},
    storage::{
        ActiveStorage, ArtifactFilter, LocalStore, Payload, StorageBackend, StorageConfig,
        StorageError, StoredArtifact,
    },
};
use common::{SERVER_ID, test_engine, wait_for_state};
use shared::{ArtifactKind, ArtifactName, Sidecar, TargetName};
use tempfile::TempDir;

mod common;

const PAYLOAD: usize = 64 * 1024;

#[test]
fn jobs_start_in_arrival_order_one_at_a_time() {
    let test = test_engine(MockProvider::new(PAYLOAD).with_delay(Duration::from_millis(20)));

    let targets: Vec<String> = (0..6).map(|index| format!("app-{index}")).collect();
    let ids: Vec<_> = targets
        .iter()
        .map(|target| test.engine.enqueue(target, ArtifactKind::Manual).unwrap())
        .collect();

    test.engine.start().unwrap();
    let finished = test.wait_all(&ids);

    assert!(finished.iter().all(|progress| progress.state == JobState::Complete));
    assert_eq!(test.provider.exports(), targets);
    assert_eq!(test.provider.max_concurrent(), 1);
}

#[test]
fn concurrent_enqueues_run_in_arrival_order() {
    let test = test_engine(MockProvider::new(PAYLOAD).with_delay(Duration::from_millis(5)));
    test.engine.start().unwrap();

    let per_producer: Vec<Vec<_>> = thread::scope(|scope| {
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let engine = &test.engine;
                scope.spawn(move || {
                    (0..5)
                        .map(|index| {
                            engine
                                .enqueue(&format!("app-{producer}-{index}"), ArtifactKind::Manual)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        producers.into_iter().map(|producer| producer.join().unwrap()).collect()
    });

    let ids: Vec<_> = per_producer.iter().flatten().copied().collect();
    let finished = test.wait_all(&ids);
    assert!(finished.iter().all(|progress| progress.state == JobState::Complete));

    // The table holds jobs in the order they were accepted.
    let accepted = test.engine.jobs();
    assert_eq!(accepted.len(), 20);
    for producer in &per_producer {
        let positions: Vec<_> = producer
            .iter()
            .map(|id| accepted.iter().position(|job| job.job_id == *id).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    let arrival: Vec<String> = accepted.iter().map(|job| job.target.to_string()).collect();
    assert_eq!(test.provider.exports(), arrival);
    assert_eq!(test.provider.max_concurrent(), 1);
}

#[test]
fn failed_job_does_not_stop_the_queue() {
    let test = test_engine(MockProvider::new(PAYLOAD));
    test.provider.fail_target("app-3");

    let ids: Vec<_> = (1..=5)
        .map(|index| {
            test.engine
                .enqueue(&format!("app-{index}"), ArtifactKind::Manual)
                .unwrap()
        })
        .collect();

    test.engine.start().unwrap();
    let finished = test.wait_all(&ids);

    for (index, progress) in finished.iter().enumerate() {
        if index == 2 {
            assert_eq!(progress.state, JobState::Error);
            assert_eq!(progress.error_class, Some(ErrorClass::Io));
            assert!(progress.detail.starts_with("IOError"));
        } else {
            assert_eq!(progress.state, JobState::Complete, "{progress:?}");
        }
    }

    let artifacts = test.engine.list_artifacts(&ArtifactFilter::default()).unwrap();
    assert_eq!(artifacts.len(), 4);
    assert!(artifacts.iter().all(|artifact| artifact.target.as_str() != "app-3"));

    // Nothing of the failed job is left on disk, staged or otherwise.
    let leftovers: Vec<_> = fs::read_dir(test.artifact_directory())
        .unwrap()
        .chain(fs::read_dir(test.artifact_directory().join(".partial")).unwrap())
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("app-3."))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    let errors = test
        .engine
        .audit_log(&AuditFilter {
            status: Some(AuditStatus::Error),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].target, "app-3");
    assert_eq!(errors[0].operation, Operation::Backup);
}

#[test]
fn completed_backup_is_listed_with_its_sidecar() {
    let test = test_engine(MockProvider::new(PAYLOAD));
    test.engine.start().unwrap();

    let id = test.engine.enqueue("web", ArtifactKind::Manual).unwrap();
    let progress = test.engine.wait(id).unwrap();
    assert_eq!(progress.state, JobState::Complete);
    assert!(progress.finished_at.is_some());

    let artifacts = test.engine.list_artifacts(&ArtifactFilter::default()).unwrap();
    assert_eq!(artifacts.len(), 1);

    let artifact = &artifacts[0];
    assert_eq!(progress.artifact.as_deref(), Some(artifact.name.as_str()));
    assert_eq!(artifact.kind, Some(ArtifactKind::Manual));
    assert_eq!(artifact.server_id.as_deref(), Some(SERVER_ID));
    assert_eq!(
        artifact.size,
        fs::metadata(test.artifact_directory().join(&artifact.name))
            .unwrap()
            .len()
    );

    let descriptor = artifact.descriptor.as_ref().unwrap();
    assert_eq!(descriptor["target"], "web");
    assert_eq!(descriptor["volumes"][0]["name"], "web-data");
}

#[test]
fn invalid_target_is_rejected() {
    let test = test_engine(MockProvider::new(PAYLOAD));
    assert!(test.engine.enqueue("-bad", ArtifactKind::Manual).is_err());
    assert!(test.engine.enqueue("", ArtifactKind::Manual).is_err());
    assert!(test.engine.jobs().is_empty());
}

#[test]
fn pending_job_can_be_cancelled() {
    let test = test_engine(MockProvider::new(PAYLOAD));

    let first = test.engine.enqueue("first", ArtifactKind::Manual).unwrap();
    let second = test.engine.enqueue("second", ArtifactKind::Manual).unwrap();

    test.engine.cancel(first).unwrap();
    assert!(test.engine.get_progress(first).is_none());
    assert_eq!(test.engine.cancel(first), Err(CancelError::NotFound(first)));

    test.engine.start().unwrap();
    let progress = test.engine.wait(second).unwrap();
    assert_eq!(progress.state, JobState::Complete);
    assert_eq!(test.provider.exports(), vec!["second".to_string()]);

    // Finished jobs can no longer be cancelled.
    assert_eq!(test.engine.cancel(second), Err(CancelError::NotFound(second)));
}

#[test]
fn running_job_can_not_be_cancelled() {
    let test = test_engine(MockProvider::new(PAYLOAD).with_delay(Duration::from_millis(500)));
    let running = test.engine.enqueue("slow", ArtifactKind::Manual).unwrap();
    let waiting = test.engine.enqueue("next", ArtifactKind::Manual).unwrap();
    assert_eq!(
        test.engine.get_progress(waiting).unwrap().state,
        JobState::Queued
    );

    test.engine.start().unwrap();
    wait_for_state(&test.engine, running, JobState::Running);

    assert_eq!(test.engine.cancel(running), Err(CancelError::Running(running)));
    assert_eq!(
        test.engine.get_progress(waiting).unwrap().state,
        JobState::Waiting
    );

    assert_eq!(test.engine.wait(running).unwrap().state, JobState::Complete);
    assert_eq!(test.engine.wait(waiting).unwrap().state, JobState::Complete);
}

#[test]
fn restore_passes_overrides_through() {
    let test = test_engine(MockProvider::new(PAYLOAD));
    test.engine.start().unwrap();

    let backup = test.engine.enqueue("db", ArtifactKind::Manual).unwrap();
    let artifact = test.engine.wait(backup).unwrap().artifact.unwrap();

    let options = RestoreOptions {
        name_override: Some("db-copy".to_string()),
        port_overrides: BTreeMap::from([("80/tcp".to_string(), "9090".to_string())]),
        volume_overrides: BTreeMap::from([("db-data".to_string(), "db-copy-data".to_string())]),
        start: true,
    };
    let restore = test.engine.restore(&artifact, options.clone()).unwrap();
    let progress = test.engine.wait(restore).unwrap();
    assert_eq!(progress.state, JobState::Complete, "{progress:?}");
    assert_eq!(progress.kind, None);

    assert_eq!(
        test.provider.imports(),
        vec![("db-copy-data".to_string(), PAYLOAD)]
    );

    let restored = test.provider.restored();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].name, "db-copy");
    assert_eq!(restored[0].options, options);
    assert_eq!(restored[0].descriptor.target.as_str(), "db");
}

#[test]
fn restore_of_missing_artifact_fails_as_not_found() {
    let test = test_engine(MockProvider::new(PAYLOAD));
    test.engine.start().unwrap();

    let id = test
        .engine
        .restore("ghost.20261019T083005000Z.tar.gz", RestoreOptions::default())
        .unwrap();
    let progress = test.engine.wait(id).unwrap();

    assert_eq!(progress.state, JobState::Error);
    assert_eq!(progress.error_class, Some(ErrorClass::NotFound));
    assert!(test.provider.restored().is_empty());
}

/// A local store that can misreport sizes, fail after storing, or pause before answering a
/// size query.
struct FaultyStore {
    inner: LocalStore,
    short_size: bool,
    fail_after_put: bool,
    size_gate: Option<(Barrier, Barrier)>,
}

impl StorageBackend for FaultyStore {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn put(&self, name: &ArtifactName, payload: Payload, sidecar: &Sidecar) -> Result<u64, StorageError> {
        let written = self.inner.put(name, payload, sidecar)?;
        if self.fail_after_put {
            return Err(StorageError::Network("connection reset after upload".to_string()));
        }
        Ok(written)
    }

    fn get(&self, name: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        self.inner.get(name)
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        let size = self.inner.size(name)?;
        if let Some((reached, release)) = &self.size_gate {
            reached.wait();
            release.wait();
        }
        Ok(if self.short_size { size - 1 } else { size })
    }

    fn list(&self) -> Result<Vec<StoredArtifact>, StorageError> {
        self.inner.list()
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.inner.delete(name)
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        self.inner.test_connection()
    }
}

struct Processor {
    table: Arc<JobTable>,
    storage: Arc<ActiveStorage>,
    backend: Arc<FaultyStore>,
    audit: Arc<AuditLog>,
    processor: QueueProcessor,
    _directory: TempDir,
}

impl Processor {
    fn new(configure: impl FnOnce(&mut FaultyStore)) -> Self {
        shared::test::init_test_logger();

        let directory = tempfile::tempdir().unwrap();
        let mut backend = FaultyStore {
            inner: LocalStore::new(directory.path().join("artifacts")).unwrap(),
            short_size: false,
            fail_after_put: false,
            size_gate: None,
        };
        configure(&mut backend);
        let backend = Arc::new(backend);

        let config = StorageConfig::Local {
            directory: directory.path().join("artifacts"),
        };
        let table = Arc::new(JobTable::new(Duration::from_secs(600)));
        let storage = Arc::new(ActiveStorage::new(config, Arc::clone(&backend) as _));
        let audit = Arc::new(AuditLog::new(Arc::new(Database::open_in_memory().unwrap())));
        let provider = Arc::new(MockProvider::new(PAYLOAD));
        let executor = Arc::new(Executor::new(
            Arc::clone(&provider) as _,
            provider as _,
            SERVER_ID.to_string(),
        ));

        let processor = QueueProcessor::new(
            Arc::clone(&table),
            executor,
            Arc::clone(&storage),
            Arc::clone(&audit),
            Duration::from_millis(10),
        );

        Self {
            table,
            storage,
            backend,
            audit,
            processor,
            _directory: directory,
        }
    }

    /// Queue a backup of `web` and execute it on this thread.
    fn back_up_web(&self) -> Progress {
        let id = self
            .table
            .insert(JobRequest::Backup {
                target: TargetName::try_from("web").unwrap(),
                kind: ArtifactKind::Manual,
            })
            .unwrap();

        let Next::Job(next, request) = self.table.next(Duration::from_secs(1)) else {
            panic!("the job was not handed out");
        };
        assert_eq!(next, id);

        self.processor.execute(next, request);
        self.table.progress(id).unwrap()
    }

    fn stored_files(&self) -> Vec<String> {
        fs::read_dir(self.backend.inner.directory())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name != ".partial")
            .collect()
    }
}

#[test]
fn size_mismatch_fails_the_job_and_discards_the_artifact() {
    let processor = Processor::new(|store| store.short_size = true);

    let progress = processor.back_up_web();
    assert_eq!(progress.state, JobState::Error);
    assert_eq!(progress.error_class, Some(ErrorClass::Consistency));
    assert!(progress.detail.starts_with("ConsistencyError"), "{}", progress.detail);

    assert!(processor.backend.list().unwrap().is_empty());
    assert!(processor.stored_files().is_empty());

    let errors = processor
        .audit
        .query(&AuditFilter {
            status: Some(AuditStatus::Error),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].detail.starts_with("ConsistencyError"));
}

#[test]
fn failed_put_discards_what_was_stored() {
    let processor = Processor::new(|store| store.fail_after_put = true);

    let progress = processor.back_up_web();
    assert_eq!(progress.state, JobState::Error);
    assert_eq!(progress.error_class, Some(ErrorClass::Io));

    assert!(processor.backend.list().unwrap().is_empty());
    assert!(processor.stored_files().is_empty(), "{:?}", processor.stored_files());
}

#[test]
fn artifact_is_hidden_until_verified() {
    let processor = Processor::new(|store| {
        store.size_gate = Some((Barrier::new(2), Barrier::new(2)));
    });
    let Some((reached, release)) = &processor.backend.size_gate else {
        unreachable!();
    };

    let progress = thread::scope(|scope| {
        let job = scope.spawn(|| processor.back_up_web());

        // Stored, but the job has not checked the stored size yet.
        reached.wait();
        assert_eq!(processor.backend.list().unwrap().len(), 1);
        assert!(processor
            .storage
            .list(processor.backend.as_ref())
            .unwrap()
            .is_empty());

        release.wait();
        job.join().unwrap()
    });

    assert_eq!(progress.state, JobState::Complete, "{progress:?}");
    let listed = processor.storage.list(processor.backend.as_ref()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(progress.artifact.as_deref(), Some(listed[0].name.as_str()));
}
