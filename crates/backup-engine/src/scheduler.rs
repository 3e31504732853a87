//! Fires scheduled backups.
//!
//! The next run is stored with the policy, so a restart neither skips nor repeats a run. When
//! a run is due the following run is claimed before anything is enqueued, so neither a slow
//! batch nor a second scheduler run can fire the same run twice.

use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use shared::{ArtifactKind, Schedule, ScheduleError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditLog, AuditStatus, Operation},
    policy::{PolicyError, PolicyStore},
    queue::{JobId, JobRequest, JobTable},
    retention::RetentionManager,
    supervisor::TaskHandle,
};

/// The scheduler as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// If the policy is enabled.
    pub enabled: bool,
    /// When the next run is due.
    pub next_run: Option<DateTime<Utc>>,
    /// When the last run fired.
    pub last_run: Option<DateTime<Utc>>,
    /// If a batch is still running or waiting to be pruned.
    pub batch_in_flight: bool,
}

/// Compute the first run of `schedule` strictly after `now`, on the local clock.
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let local = now.with_timezone(&Local);
    Ok(schedule.next_run_after(&local)?.with_timezone(&Utc))
}

/// Enqueues the policy's targets when a run is due.
pub struct Scheduler {
    policies: Arc<PolicyStore>,
    table: Arc<JobTable>,
    retention: Arc<RetentionManager>,
    audit: Arc<AuditLog>,
    in_flight: Arc<AtomicUsize>,
    poll_interval: Duration,
}

impl Scheduler {
    /// Create a scheduler checking the clock every `poll_interval`.
    pub fn new(
        policies: Arc<PolicyStore>,
        table: Arc<JobTable>,
        retention: Arc<RetentionManager>,
        audit: Arc<AuditLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            policies,
            table,
            retention,
            audit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            poll_interval,
        }
    }

    /// Check the clock until shutdown or until this run is replaced.
    pub fn run(&self, handle: &TaskHandle) {
        info!("[Scheduler] Started");

        loop {
            handle.beat();

            if let Err(error) = self.tick(Utc::now()) {
                error!("[Scheduler] {error}");
            }

            if !handle.sleep(self.poll_interval) {
                break;
            }
        }

        info!("[Scheduler] Stopped");
    }

    /// Compare `now` against the stored next run, enqueueing the batch if it is due. Returns
    /// the enqueued jobs when a run fired.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Option<Vec<JobId>>, SchedulerError> {
        let policy = self.policies.load()?;
        if !policy.enabled {
            return Ok(None);
        }

        let (stored_next, _) = self.policies.run_times()?;
        let Some(due) = stored_next else {
            let next = next_run(&policy.schedule, now)?;
            debug!("[Scheduler] No next run stored, next run is {next}");
            self.policies.set_next_run(Some(next))?;
            return Ok(None);
        };

        if now < due {
            return Ok(None);
        }

        let following = next_run(&policy.schedule, now)?;
        // A replaced run that wakes up late must not fire the same run again.
        if !self.policies.claim_run(due, now, Some(following))? {
            debug!("[Scheduler] Run due at {due} was already fired");
            return Ok(None);
        }
        info!(
            "[Scheduler] Run due at {due} fired, {} target(s), next run is {following}",
            policy.targets.len()
        );

        let mut batch = Vec::with_capacity(policy.targets.len());
        for target in &policy.targets {
            let request = JobRequest::Backup {
                target: target.clone(),
                kind: ArtifactKind::Scheduled,
            };

            match self.table.insert(request) {
                Ok(id) => batch.push(id),
                Err(error) => {
                    warn!("[Scheduler] Could not enqueue {target}: {error}");
                    if let Err(error) = self.audit.record(
                        Operation::Backup,
                        target.as_str(),
                        AuditStatus::Error,
                        &format!("scheduled enqueue failed: {error}"),
                    ) {
                        error!("[Scheduler] Could not write audit entry: {error}");
                    }
                }
            }
        }

        if !batch.is_empty() {
            if let Err(error) = self.retention.prune_after(
                Arc::clone(&self.table),
                batch.clone(),
                policy.targets.clone(),
                policy.keep,
                Arc::clone(&self.in_flight),
            ) {
                error!("[Scheduler] Could not start retention for the batch: {error}");
            }
        }

        Ok(Some(batch))
    }

    /// The current schedule state.
    pub fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let policy = self.policies.load()?;
        let (next_run, last_run) = self.policies.run_times()?;

        Ok(SchedulerStatus {
            enabled: policy.enabled,
            next_run,
            last_run,
            batch_in_flight: self.in_flight.load(Ordering::SeqCst) > 0,
        })
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to read the retention policy:\n{0}")]
    Policy(#[from] PolicyError),

    #[error("Failed to compute the next run:\n{0}")]
    Schedule(#[from] ScheduleError),
}
