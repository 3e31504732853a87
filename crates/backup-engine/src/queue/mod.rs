//! The sequential queue processor.
//!
//! Owns the only execution slot: jobs are taken from the [`JobTable`] strictly in arrival
//! order and executed one at a time. A job's failure is recorded and the queue moves on.

use core::time::Duration;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use shared::{ArtifactKind, ArtifactName, TargetName};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    Context,
    audit::{AuditLog, AuditStatus, Operation},
    error::{Classify, ErrorClass},
    executor::{BackupRequest, Executor, ExecutorError},
    snapshot::RestoreOptions,
    storage::{ActiveStorage, StorageBackend, StorageError},
    supervisor::TaskHandle,
};

mod job;
mod table;

pub use job::{JobId, JobRequest, JobState, Progress};
pub use table::{CancelError, JobTable, Next, QueueError};

/// How many later timestamps are tried when an artifact name is taken.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Drains the job table through the executor.
pub struct QueueProcessor {
    table: Arc<JobTable>,
    executor: Arc<Executor>,
    storage: Arc<ActiveStorage>,
    audit: Arc<AuditLog>,
    idle_wait: Duration,
}

impl QueueProcessor {
    /// Create a processor. `idle_wait` bounds how long it blocks between heartbeats when the
    /// queue is empty.
    pub fn new(
        table: Arc<JobTable>,
        executor: Arc<Executor>,
        storage: Arc<ActiveStorage>,
        audit: Arc<AuditLog>,
        idle_wait: Duration,
    ) -> Self {
        Self {
            table,
            executor,
            storage,
            audit,
            idle_wait,
        }
    }

    /// Process jobs until shutdown or until this run is replaced.
    pub fn run(&self, handle: &TaskHandle) {
        // A previous run may have died holding the slot.
        if let Some(id) = self.table.abandon_active("the queue processor stopped while running this job") {
            error!("[Queue] Job {id} was abandoned by a previous queue processor");
            if let Some(progress) = self.table.progress(id) {
                self.audit(
                    progress.operation,
                    &progress.target,
                    AuditStatus::Error,
                    &progress.detail,
                );
            }
        }

        while handle.should_continue() {
            handle.beat();

            match self.table.next(self.idle_wait) {
                Next::Job(id, request) => self.execute(id, request),
                Next::Idle => {}
                Next::Closed => break,
            }
        }

        info!("[Queue] Stopped");
    }

    /// Execute one job that is already `Starting`, leaving it terminal.
    pub fn execute(&self, id: JobId, request: JobRequest) {
        match request {
            JobRequest::Backup { target, kind } => self.execute_backup(id, &target, kind),
            JobRequest::Restore {
                artifact,
                target,
                options,
            } => self.execute_restore(id, &artifact, &target, &options),
        }
    }

    fn execute_backup(&self, id: JobId, target: &TargetName, kind: ArtifactKind) {
        let mut context = Context::for_job(id, target.as_str(), "backup");
        info!("{context}Starting {kind} backup");
        self.audit(Operation::Backup, target, AuditStatus::Started, kind.as_str());

        // Pin the backend so a storage switch mid-job does not split the artifact.
        let storage = self.storage.current();

        context.current_context = "Allocate";
        let result = allocate_name(storage.as_ref(), target)
            .map_err(JobError::from)
            .and_then(|(name, created_at)| {
                // Listings skip the artifact until it is verified or removed.
                let _unverified = self.storage.hold(&name);

                let request = BackupRequest {
                    target,
                    kind,
                    name: &name,
                    created_at,
                };
                match self.run_backup(&mut context, id, storage.as_ref(), &request) {
                    Ok(size) => Ok((name, size)),
                    Err(error) => {
                        discard_partial(&context, storage.as_ref(), &name);
                        Err(error)
                    }
                }
            });

        match result {
            Ok((name, size)) => {
                // The trail is written before the job turns terminal.
                self.audit(Operation::Backup, target, AuditStatus::Completed, name.as_str());
                self.finish(&context, id, &format!("{name} ({size} bytes)"));
            }
            Err(error) => {
                self.audit(
                    Operation::Backup,
                    target,
                    AuditStatus::Error,
                    &format!("{}: {error}", error.class()),
                );
                self.fail(&context, id, &error);
            }
        }
    }

    fn run_backup(
        &self,
        context: &mut Context,
        id: JobId,
        storage: &dyn StorageBackend,
        request: &BackupRequest<'_>,
    ) -> Result<u64, JobError> {
        let name = request.name;
        self.table.set_artifact(id, name.as_str());
        self.table.transition(id, JobState::Running, "Running")?;

        let written = self.executor.backup(context, storage, request, &|detail| {
            self.table.set_detail(id, detail);
        })?;

        // The backend's own view of the artifact decides completion, not the write call.
        context.current_context = "Verify";
        let stored = storage.size(name.as_str())?;
        if stored != written {
            return Err(JobError::SizeMismatch(written, stored));
        }

        Ok(stored)
    }

    fn execute_restore(&self, id: JobId, artifact: &str, target: &TargetName, options: &RestoreOptions) {
        let mut context = Context::for_job(id, target.as_str(), "restore");
        info!("{context}Restoring {artifact}");
        self.audit(Operation::Restore, target, AuditStatus::Started, artifact);

        let storage = self.storage.current();
        self.table.set_artifact(id, artifact);

        let result = self
            .table
            .transition(id, JobState::Running, "Running")
            .map_err(JobError::from)
            .and_then(|()| {
                self.executor
                    .restore(&mut context, storage.as_ref(), artifact, options, &|detail| {
                        self.table.set_detail(id, detail);
                    })
                    .map_err(JobError::from)
            });

        match result {
            Ok(restored) => {
                self.audit(
                    Operation::Restore,
                    target,
                    AuditStatus::Completed,
                    &format!("{artifact} as {restored}"),
                );
                self.finish(&context, id, &format!("Restored as {restored}"));
            }
            Err(error) => {
                self.audit(
                    Operation::Restore,
                    target,
                    AuditStatus::Error,
                    &format!("{}: {error}", error.class()),
                );
                self.fail(&context, id, &error);
            }
        }
    }

    fn finish(&self, context: &Context, id: JobId, detail: &str) {
        info!("{context}Complete: {detail}");
        if let Err(error) = self.table.transition(id, JobState::Complete, detail) {
            error!("{context}{error}");
        }
    }

    fn fail(&self, context: &Context, id: JobId, error: &JobError) {
        let class = error.class();
        error!("{context}{class}: {error}");
        if let Err(error) = self.table.fail(id, class, format!("{class}: {error}")) {
            error!("{context}{error}");
        }
    }

    fn audit(&self, operation: Operation, target: &TargetName, status: AuditStatus, detail: &str) {
        if let Err(error) = self.audit.record(operation, target.as_str(), status, detail) {
            error!("[Queue] Could not write audit entry: {error}");
        }
    }
}

/// Pick an artifact name that is not taken in `storage`, stepping the timestamp forward on a
/// collision.
fn allocate_name(
    storage: &dyn StorageBackend,
    target: &TargetName,
) -> Result<(ArtifactName, DateTime<Utc>), StorageError> {
    let mut created_at = Utc::now().trunc_subsecs(3);
    let mut name = ArtifactName::new(target, created_at);

    for _ in 0..MAX_NAME_ATTEMPTS {
        if !storage.exists(name.as_str())? {
            return Ok((name, created_at));
        }
        (name, created_at) = name.next_after(created_at);
    }

    Err(StorageError::Consistency(
        name.to_string(),
        "no free artifact name".to_string(),
    ))
}

/// Remove whatever a failed job left under its name.
fn discard_partial(context: &Context, storage: &dyn StorageBackend, name: &ArtifactName) {
    match storage.delete(name.as_str()) {
        Ok(()) => info!("{context}Removed partial artifact {name}"),
        Err(StorageError::NotFound(_)) => {}
        Err(error) => warn!("{context}Could not remove partial artifact {name}: {error}"),
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Artifact was {1} bytes in storage, but {0} bytes were written")]
    SizeMismatch(u64, u64),
}

impl Classify for JobError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Executor(error) => error.class(),
            Self::Storage(error) => error.class(),
            Self::Queue(_) => ErrorClass::Io,
            Self::SizeMismatch(..) => ErrorClass::Consistency,
        }
    }
}
