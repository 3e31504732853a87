//! Prunes scheduled artifacts down to the policy's keep count once a batch has finished.
//!

use std::{
    collections::BTreeSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use shared::TargetName;
use tracing::{error, info, warn};

use crate::{
    Context,
    audit::{AuditLog, AuditStatus, Operation},
    queue::{JobId, JobTable},
    storage::{ActiveStorage, Consistency, StoredArtifact},
};

/// The artifacts of `target` that fall outside the newest `keep` scheduled ones.
///
/// Only consistent scheduled artifacts written by `server_id` are candidates. Manual
/// artifacts and artifacts with an unusable sidecar are neither counted nor returned.
pub fn select_for_deletion<'a>(
    artifacts: &'a [StoredArtifact],
    target: &TargetName,
    server_id: &str,
    keep: u32,
) -> Vec<&'a StoredArtifact> {
    let mut candidates: Vec<&StoredArtifact> = artifacts
        .iter()
        .filter(|artifact| {
            artifact.target == *target
                && artifact.consistency == Consistency::Consistent
                && artifact.kind.is_some_and(|kind| kind.is_retained_by_policy())
                && artifact.server_id.as_deref() == Some(server_id)
        })
        .collect();

    // Newest first, ties broken by name so the order is stable.
    candidates.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });

    let keep = usize::try_from(keep).unwrap_or(usize::MAX);
    candidates.into_iter().skip(keep).collect()
}

/// The outcome of one pruning pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Artifacts that were deleted.
    pub deleted: Vec<String>,
    /// Artifacts that could not be deleted.
    pub failed: Vec<String>,
}

/// Applies the keep count to the active storage backend.
pub struct RetentionManager {
    storage: Arc<ActiveStorage>,
    audit: Arc<AuditLog>,
    server_id: String,
}

impl RetentionManager {
    /// Create a manager that only prunes artifacts written by `server_id`.
    pub fn new(storage: Arc<ActiveStorage>, audit: Arc<AuditLog>, server_id: String) -> Self {
        Self {
            storage,
            audit,
            server_id,
        }
    }

    /// Delete every scheduled artifact of `targets` beyond the newest `keep`. A failed
    /// deletion is audited and pruning carries on.
    pub fn prune(&self, targets: &BTreeSet<TargetName>, keep: u32) -> PruneReport {
        let context = Context::named("Retention");
        let mut report = PruneReport::default();

        let storage = self.storage.current();
        let artifacts = match self.storage.list(storage.as_ref()) {
            Ok(artifacts) => artifacts,
            Err(error) => {
                error!("{context}Could not list {}: {error}", storage.describe());
                for target in targets {
                    self.audit(target, AuditStatus::Error, &format!("list failed: {error}"));
                }
                return report;
            }
        };

        for target in targets {
            let excess = select_for_deletion(&artifacts, target, &self.server_id, keep);
            if excess.is_empty() {
                continue;
            }

            info!("{context}Pruning {} artifact(s) of {target}", excess.len());

            for artifact in excess {
                match storage.delete(&artifact.name) {
                    Ok(()) => {
                        self.audit(target, AuditStatus::Completed, &artifact.name);
                        report.deleted.push(artifact.name.clone());
                    }
                    Err(error) => {
                        warn!("{context}Could not delete {}: {error}", artifact.name);
                        self.audit(
                            target,
                            AuditStatus::Error,
                            &format!("{}: {error}", artifact.name),
                        );
                        report.failed.push(artifact.name.clone());
                    }
                }
            }
        }

        report
    }

    /// Prune on a background thread once every job in `batch` is terminal. `in_flight` is
    /// held above zero until pruning is done.
    pub fn prune_after(
        self: &Arc<Self>,
        table: Arc<JobTable>,
        batch: Vec<JobId>,
        targets: BTreeSet<TargetName>,
        keep: u32,
        in_flight: Arc<AtomicUsize>,
    ) -> Result<JoinHandle<()>, io::Error> {
        let manager = Arc::clone(self);
        in_flight.fetch_add(1, Ordering::SeqCst);

        let counter = Arc::clone(&in_flight);
        let spawned = thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || {
                if table.wait_all(&batch) {
                    let report = manager.prune(&targets, keep);
                    info!(
                        "[Retention] Batch of {} done, deleted {} artifact(s), {} failed",
                        batch.len(),
                        report.deleted.len(),
                        report.failed.len()
                    );
                } else {
                    warn!("[Retention] Shut down before the batch finished, skipping pruning");
                }

                counter.fetch_sub(1, Ordering::SeqCst);
            });

        if spawned.is_err() {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        spawned
    }

    fn audit(&self, target: &TargetName, status: AuditStatus, detail: &str) {
        if let Err(error) = self
            .audit
            .record(Operation::Cleanup, target.as_str(), status, detail)
        {
            error!("[Retention] Could not write audit entry: {error}");
        }
    }
}
