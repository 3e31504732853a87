//! The engine facade: the only surface the surrounding system talks to.
//!

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use shared::{ArtifactKind, ArtifactName, ArtifactNameError, TargetName, TargetNameError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    Config,
    audit::{AuditEntry, AuditError, AuditFilter, AuditLog, AuditStats, AuditStatus, Operation},
    credentials::{
        CredentialError, CredentialStore, CredentialUpdate, CredentialView, RemoteCredentials,
    },
    database::{Database, DatabaseError},
    error::{Classify, ErrorClass},
    executor::Executor,
    policy::{PolicyError, PolicyStore, RetentionPolicy},
    queue::{CancelError, JobId, JobRequest, JobTable, Progress, QueueError, QueueProcessor},
    retention::{PruneReport, RetentionManager},
    scheduler::{Scheduler, SchedulerError, SchedulerStatus, next_run},
    snapshot::{DockerCli, RestoreApplicator, RestoreOptions, SnapshotProvider},
    storage::{
        ActiveStorage, ArtifactFilter, RemoteOptions, RemoteStore, StorageBackend, StorageConfig,
        StorageError, StoredArtifact, open_backend,
    },
    supervisor::{ShutdownSignal, SpawnError, Supervisor, TaskConfig, TaskHandle},
    vault::{Vault, VaultError},
};

const QUEUE_TASK: &str = "queue";
const SCHEDULER_TASK: &str = "scheduler";

/// The backup orchestration engine.
pub struct Engine {
    config: Config,
    table: Arc<JobTable>,
    storage: Arc<ActiveStorage>,
    audit: Arc<AuditLog>,
    policies: Arc<PolicyStore>,
    credentials: CredentialStore,
    processor: Arc<QueueProcessor>,
    scheduler: Arc<Scheduler>,
    retention: Arc<RetentionManager>,
    shutdown: Arc<ShutdownSignal>,
    supervisor: Arc<Supervisor>,
    supervisor_thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes backend switches.
    switching: Mutex<()>,
}

impl Engine {
    /// Open the database and vault named by the config and drive the docker CLI.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let database = Arc::new(Database::open(&config.database_path())?);
        let vault = Vault::open_or_create(&config.key_file)?;
        let docker = Arc::new(DockerCli::new(&config.docker));
        // The same CLI both snapshots and restores.
        let provider = Arc::clone(&docker);

        Self::with_parts(config, database, vault, provider, docker)
    }

    /// Build an engine from already opened parts.
    pub fn with_parts(
        config: Config,
        database: Arc<Database>,
        vault: Vault,
        provider: Arc<dyn SnapshotProvider>,
        applicator: Arc<dyn RestoreApplicator>,
    ) -> Result<Self, EngineError> {
        let credentials = CredentialStore::new(Arc::clone(&database), vault);
        let stored = match &config.storage {
            StorageConfig::Remote(_) => credentials.load()?,
            StorageConfig::Local { .. } => None,
        };

        let backend = open_backend(&config.storage, stored)?;
        info!("Storing artifacts in {}", backend.describe());
        let storage = Arc::new(ActiveStorage::new(config.storage.clone(), backend));

        let audit = Arc::new(AuditLog::new(Arc::clone(&database)));
        let policies = Arc::new(PolicyStore::new(database));
        let table = Arc::new(JobTable::new(config.queue.progress_ttl()));

        let executor = Arc::new(Executor::new(provider, applicator, config.server_id.clone()));
        let processor = Arc::new(QueueProcessor::new(
            Arc::clone(&table),
            executor,
            Arc::clone(&storage),
            Arc::clone(&audit),
            config.scheduler.poll_interval(),
        ));

        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&storage),
            Arc::clone(&audit),
            config.server_id.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&policies),
            Arc::clone(&table),
            Arc::clone(&retention),
            Arc::clone(&audit),
            config.scheduler.poll_interval(),
        ));

        let shutdown = Arc::new(ShutdownSignal::new());
        let supervisor = Arc::new(Supervisor::new(
            config.scheduler.supervisor_interval(),
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            config,
            table,
            storage,
            audit,
            policies,
            credentials,
            processor,
            scheduler,
            retention,
            shutdown,
            supervisor,
            supervisor_thread: Mutex::new(None),
            switching: Mutex::new(()),
        })
    }

    /// Start the queue processor and scheduler under the supervisor.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut supervisor_thread = self
            .supervisor_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisor_thread.is_some() || self.shutdown.is_triggered() {
            return Err(EngineError::AlreadyStarted);
        }

        let processor = Arc::clone(&self.processor);
        self.supervisor.spawn(TaskConfig {
            name: QUEUE_TASK,
            // Jobs may block for a long time, so only a dead thread is restarted.
            heartbeat_timeout: None,
            body: Arc::new(move |handle: &TaskHandle| processor.run(handle)),
        })?;

        let scheduler = Arc::clone(&self.scheduler);
        self.supervisor.spawn(TaskConfig {
            name: SCHEDULER_TASK,
            heartbeat_timeout: Some(self.config.scheduler.heartbeat_timeout()),
            body: Arc::new(move |handle: &TaskHandle| scheduler.run(handle)),
        })?;

        let supervisor = Arc::clone(&self.supervisor);
        let thread = thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || supervisor.run())
            .map_err(EngineError::SpawnSupervisor)?;
        *supervisor_thread = Some(thread);

        info!("Engine started");
        Ok(())
    }

    /// Stop the background tasks. A running job is finished first.
    pub fn shutdown(&self) {
        if self.shutdown.is_triggered() {
            return;
        }

        info!("Engine shutting down");
        self.shutdown.trigger();
        self.table.close();

        let thread = self
            .supervisor_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match thread {
            Some(thread) => {
                if thread.join().is_err() {
                    error!("The supervisor panicked while shutting down");
                }
            }
            None => self.supervisor.join(),
        }
    }

    /// Accept a backup of `target`. Returns immediately.
    pub fn enqueue(&self, target: &str, kind: ArtifactKind) -> Result<JobId, EngineError> {
        let target = TargetName::try_from(target)?;
        let id = self.table.insert(JobRequest::Backup { target, kind })?;
        Ok(id)
    }

    /// Accept a restore of `artifact`. Returns immediately.
    pub fn restore(&self, artifact: &str, options: RestoreOptions) -> Result<JobId, EngineError> {
        let name = ArtifactName::parse(artifact)?;
        let id = self.table.insert(JobRequest::Restore {
            artifact: name.as_str().to_string(),
            target: name.target().clone(),
            options,
        })?;
        Ok(id)
    }

    /// The progress of a job, while it is retained.
    pub fn get_progress(&self, id: JobId) -> Option<Progress> {
        self.table.progress(id)
    }

    /// Every retained job, oldest first.
    pub fn jobs(&self) -> Vec<Progress> {
        self.table.snapshot()
    }

    /// Block until a job is terminal.
    pub fn wait(&self, id: JobId) -> Option<Progress> {
        self.table.wait(id)
    }

    /// Remove a job that has not started.
    pub fn cancel(&self, id: JobId) -> Result<(), CancelError> {
        self.table.cancel(id)?;
        info!("Cancelled job {id}");
        Ok(())
    }

    /// List artifacts in the active backend, newest first.
    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<StoredArtifact>, EngineError> {
        let artifacts = self.storage.list(self.storage.current().as_ref())?;
        Ok(artifacts
            .into_iter()
            .filter(|artifact| filter.matches(artifact))
            .collect())
    }

    /// Delete an artifact and its sidecar.
    pub fn delete_artifact(&self, artifact: &str) -> Result<(), EngineError> {
        let name = ArtifactName::parse(artifact)
            .map_err(|_| StorageError::NotFound(artifact.to_string()))?;
        let target = name.target().as_str();

        match self.storage.current().delete(name.as_str()) {
            Ok(()) => {
                info!("Deleted {name}");
                self.record(Operation::Delete, target, AuditStatus::Completed, name.as_str());
                Ok(())
            }
            Err(error) => {
                warn!("Could not delete {name}: {error}");
                self.record(
                    Operation::Delete,
                    target,
                    AuditStatus::Error,
                    &format!("{}: {error}", error.class()),
                );
                Err(error.into())
            }
        }
    }

    /// The stored retention policy.
    pub fn get_policy(&self) -> Result<RetentionPolicy, EngineError> {
        Ok(self.policies.load()?)
    }

    /// Validate and store a retention policy, recomputing the next run.
    pub fn set_policy(&self, policy: &RetentionPolicy) -> Result<(), EngineError> {
        policy.validate()?;

        let next = if policy.enabled {
            Some(next_run(&policy.schedule, Utc::now()).map_err(SchedulerError::from)?)
        } else {
            None
        };

        self.policies.save(policy, next)?;
        info!("Retention policy updated, next run {next:?}");
        Ok(())
    }

    /// The scheduler's state.
    pub fn scheduler_status(&self) -> Result<SchedulerStatus, EngineError> {
        Ok(self.scheduler.status()?)
    }

    /// Run one scheduler check against `now`, returning the enqueued batch if a run fired.
    pub fn tick_scheduler(&self, now: DateTime<Utc>) -> Result<Option<Vec<JobId>>, EngineError> {
        Ok(self.scheduler.tick(now)?)
    }

    /// Apply the stored policy's keep count now.
    pub fn apply_retention(&self) -> Result<PruneReport, EngineError> {
        let policy = self.policies.load()?;
        Ok(self.retention.prune(&policy.targets, policy.keep))
    }

    /// How many times a background task has been restarted.
    pub fn task_restarts(&self, name: &str) -> Option<u32> {
        self.supervisor.restarts(name)
    }

    /// Audit entries matching the filter, newest first.
    pub fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.audit.query(filter)?)
    }

    /// Remove every audit entry. Irreversible.
    pub fn clear_audit_log(&self) -> Result<usize, EngineError> {
        let removed = self.audit.clear()?;
        warn!("Cleared {removed} audit entries");
        Ok(removed)
    }

    /// Audit entry counts over the last day and week.
    pub fn audit_stats(&self) -> Result<AuditStats, EngineError> {
        Ok(self.audit.stats(Utc::now())?)
    }

    /// The stored remote credentials with their secrets redacted.
    pub fn credentials(&self) -> Result<Option<CredentialView>, EngineError> {
        Ok(self.credentials.view()?)
    }

    /// Check credentials against the remote store without storing them.
    pub fn test_storage_connection(&self, update: &CredentialUpdate) -> Result<(), EngineError> {
        self.connect_remote(update).map(|_| ())
    }

    /// Test and then store remote credentials. The stored credentials are only replaced once
    /// the new ones have been confirmed.
    pub fn set_credentials(&self, update: &CredentialUpdate) -> Result<(), EngineError> {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);

        let (store, credentials) = self.connect_remote(update)?;
        self.credentials.save(&credentials)?;

        let config = self.storage.config();
        if matches!(config, StorageConfig::Remote(_)) {
            info!("Remote credentials replaced, now storing in {}", store.describe());
            self.storage.replace(config, Arc::new(store));
        }

        Ok(())
    }

    fn connect_remote(
        &self,
        update: &CredentialUpdate,
    ) -> Result<(RemoteStore, RemoteCredentials), EngineError> {
        let credentials = self.credentials.resolve(update)?;
        let options = match self.storage.config() {
            StorageConfig::Remote(options) => options,
            StorageConfig::Local { .. } => RemoteOptions::default(),
        };

        let store = RemoteStore::new(options, credentials.clone())?;
        store.test_connection()?;

        Ok((store, credentials))
    }

    /// The config of the active backend.
    pub fn storage_config(&self) -> StorageConfig {
        self.storage.config()
    }

    /// Switch the backend new artifacts are written to. Existing artifacts are not moved.
    pub fn set_storage(&self, config: StorageConfig) -> Result<(), EngineError> {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);

        let credentials = match &config {
            StorageConfig::Remote(_) => self.credentials.load()?,
            StorageConfig::Local { .. } => None,
        };

        let backend = open_backend(&config, credentials)?;
        backend.test_connection()?;

        info!("Now storing artifacts in {}", backend.describe());
        self.storage.replace(config, backend);
        Ok(())
    }

    fn record(&self, operation: Operation, target: &str, status: AuditStatus, detail: &str) {
        if let Err(error) = self.audit.record(operation, target, status, detail) {
            error!("Could not write audit entry: {error}");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to open the database:\n{0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to open the vault:\n{0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Invalid target:\n{0}")]
    Target(#[from] TargetNameError),

    #[error("Invalid artifact:\n{0}")]
    Artifact(#[from] ArtifactNameError),

    #[error("Failed to start a background task:\n{0}")]
    Spawn(#[from] SpawnError),

    #[error("Failed to start the supervisor:\n{0}")]
    SpawnSupervisor(#[source] io::Error),

    #[error("The engine was already started")]
    AlreadyStarted,
}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(error) => error.class(),
            Self::Credential(CredentialError::Missing(_)) => ErrorClass::Auth,
            Self::Credential(_) => ErrorClass::Io,
            Self::Artifact(_) => ErrorClass::NotFound,
            Self::Database(_)
            | Self::Vault(_)
            | Self::Policy(_)
            | Self::Scheduler(_)
            | Self::Audit(_)
            | Self::Queue(_)
            | Self::Target(_)
            | Self::Spawn(_)
            | Self::SpawnSupervisor(_)
            | Self::AlreadyStarted => ErrorClass::Io,
        }
    }
}
