use core::time::Duration;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use chrono::Utc;
use thiserror::Error;

use super::job::{JobId, JobRequest, JobState, Progress};
use crate::error::ErrorClass;

struct Entry {
    request: JobRequest,
    progress: Progress,
    finished: Option<Instant>,
}

#[derive(Default)]
struct Jobs {
    entries: HashMap<JobId, Entry>,
    /// Pending jobs in arrival order.
    pending: VecDeque<JobId>,
    /// The job holding the execution slot.
    active: Option<JobId>,
    /// Insertion order, for listings.
    order: Vec<JobId>,
    closed: bool,
}

/// What the processor should do next.
pub enum Next {
    /// Execute this job. It is already `Starting`.
    Job(JobId, JobRequest),
    /// Nothing arrived before the timeout.
    Idle,
    /// The table was closed.
    Closed,
}

/// The thread-safe job table shared by the queue processor, the scheduler and callers.
///
/// A single lock guards every insert, dequeue and transition. Waiters are woken through one
/// condition variable whenever any job changes.
pub struct JobTable {
    jobs: Mutex<Jobs>,
    changed: Condvar,
    ttl: Duration,
}

impl JobTable {
    /// Create a table that keeps finished jobs for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            changed: Condvar::new(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a job. Never blocks on the running job.
    pub fn insert(&self, request: JobRequest) -> Result<JobId, QueueError> {
        let id = JobId::new();

        let mut jobs = self.lock();
        if jobs.closed {
            return Err(QueueError::Closed);
        }
        self.purge(&mut jobs);

        let progress = Progress {
            job_id: id,
            target: request.target().clone(),
            operation: request.operation(),
            kind: request.kind(),
            state: JobState::Queued,
            detail: String::new(),
            error_class: None,
            artifact: None,
            requested_at: Utc::now(),
            finished_at: None,
        };

        jobs.entries.insert(
            id,
            Entry {
                request,
                progress,
                finished: None,
            },
        );
        jobs.pending.push_back(id);
        jobs.order.push(id);
        drop(jobs);

        self.changed.notify_all();

        Ok(id)
    }

    /// Wait up to `timeout` for the execution slot to be free and a job to be pending, then
    /// take the oldest job.
    pub fn next(&self, timeout: Duration) -> Next {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.lock();

        loop {
            if jobs.closed {
                return Next::Closed;
            }

            if jobs.active.is_none() {
                if let Some(id) = jobs.pending.pop_front() {
                    return self.start(jobs, id);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Next::Idle;
            }

            jobs = self
                .changed
                .wait_timeout(jobs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn start(&self, mut jobs: MutexGuard<'_, Jobs>, id: JobId) -> Next {
        jobs.active = Some(id);

        // Everything still pending now waits behind this job.
        let waiting: Vec<JobId> = jobs.pending.iter().copied().collect();
        for waiting_id in waiting {
            if let Some(entry) = jobs.entries.get_mut(&waiting_id) {
                if entry.progress.state == JobState::Queued {
                    entry.progress.state = JobState::Waiting;
                }
            }
        }

        let request = match jobs.entries.get_mut(&id) {
            Some(entry) => {
                entry.progress.state = JobState::Starting;
                entry.request.clone()
            }
            None => {
                jobs.active = None;
                return Next::Idle;
            }
        };
        drop(jobs);

        self.changed.notify_all();

        Next::Job(id, request)
    }

    /// Move a job to `state`, rejecting illegal transitions.
    pub fn transition(&self, id: JobId, state: JobState, detail: impl Into<String>) -> Result<(), QueueError> {
        self.update(id, |entry| {
            let current = entry.progress.state;
            if !current.can_become(state) {
                return Err(QueueError::Transition(id, current, state));
            }

            entry.progress.state = state;
            entry.progress.detail = detail.into();
            Ok(())
        })
    }

    /// Fail a job with a classified error.
    pub fn fail(&self, id: JobId, class: ErrorClass, detail: impl Into<String>) -> Result<(), QueueError> {
        self.update(id, |entry| {
            let current = entry.progress.state;
            if !current.can_become(JobState::Error) {
                return Err(QueueError::Transition(id, current, JobState::Error));
            }

            entry.progress.state = JobState::Error;
            entry.progress.error_class = Some(class);
            entry.progress.detail = detail.into();
            Ok(())
        })
    }

    /// Replace a job's progress message.
    pub fn set_detail(&self, id: JobId, detail: impl Into<String>) {
        let _ = self.update(id, |entry| {
            entry.progress.detail = detail.into();
            Ok(())
        });
    }

    /// Record the artifact a job writes or reads.
    pub fn set_artifact(&self, id: JobId, artifact: impl Into<String>) {
        let _ = self.update(id, |entry| {
            entry.progress.artifact = Some(artifact.into());
            Ok(())
        });
    }

    fn update<F>(&self, id: JobId, change: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Entry) -> Result<(), QueueError>,
    {
        let mut jobs = self.lock();
        let entry = jobs.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        change(entry)?;

        let terminal = entry.progress.state.is_terminal();
        if terminal && entry.finished.is_none() {
            entry.finished = Some(Instant::now());
            entry.progress.finished_at = Some(Utc::now());
        }
        if terminal && jobs.active == Some(id) {
            jobs.active = None;
        }
        drop(jobs);

        self.changed.notify_all();
        Ok(())
    }

    /// The current progress of a job.
    pub fn progress(&self, id: JobId) -> Option<Progress> {
        let mut jobs = self.lock();
        self.purge(&mut jobs);
        jobs.entries.get(&id).map(|entry| entry.progress.clone())
    }

    /// Every known job, oldest first.
    pub fn snapshot(&self) -> Vec<Progress> {
        let mut jobs = self.lock();
        self.purge(&mut jobs);
        jobs.order
            .iter()
            .filter_map(|id| jobs.entries.get(id))
            .map(|entry| entry.progress.clone())
            .collect()
    }

    /// Remove a job that has not started. Running jobs can only be waited on.
    pub fn cancel(&self, id: JobId) -> Result<(), CancelError> {
        let mut jobs = self.lock();

        let Some(entry) = jobs.entries.get(&id) else {
            return Err(CancelError::NotFound(id));
        };
        let state = entry.progress.state;
        if state.is_active() {
            return Err(CancelError::Running(id));
        }
        if !state.is_pending() {
            return Err(CancelError::NotFound(id));
        }

        jobs.entries.remove(&id);
        jobs.pending.retain(|pending| *pending != id);
        jobs.order.retain(|known| *known != id);
        drop(jobs);

        self.changed.notify_all();
        Ok(())
    }

    /// Block until the job is terminal, returning its final progress. Returns `None` if the
    /// job is unknown, was cancelled or the table closed first.
    pub fn wait(&self, id: JobId) -> Option<Progress> {
        let mut jobs = self.lock();
        loop {
            match jobs.entries.get(&id) {
                None => return None,
                Some(entry) if entry.progress.state.is_terminal() => {
                    return Some(entry.progress.clone());
                }
                Some(_) if jobs.closed => return None,
                Some(_) => {}
            }

            jobs = self
                .changed
                .wait(jobs)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until every job in `ids` is terminal or gone. Returns `false` if the table was
    /// closed first.
    pub fn wait_all(&self, ids: &[JobId]) -> bool {
        let mut jobs = self.lock();
        loop {
            let outstanding = ids.iter().any(|id| {
                jobs.entries
                    .get(id)
                    .is_some_and(|entry| !entry.progress.state.is_terminal())
            });
            if !outstanding {
                return true;
            }
            if jobs.closed {
                return false;
            }

            jobs = self
                .changed
                .wait(jobs)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Fail the job holding the execution slot, if any. Used when the processor that owned it
    /// was replaced.
    pub fn abandon_active(&self, detail: &str) -> Option<JobId> {
        let id = self.lock().active?;
        self.fail(id, ErrorClass::Io, detail).ok()?;
        Some(id)
    }

    /// Stop accepting jobs and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    /// Drop finished jobs older than the ttl.
    fn purge(&self, jobs: &mut Jobs) {
        let ttl = self.ttl;
        let expired: Vec<JobId> = jobs
            .entries
            .iter()
            .filter(|(_, entry)| entry.finished.is_some_and(|finished| finished.elapsed() > ttl))
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return;
        }

        for id in &expired {
            jobs.entries.remove(id);
        }
        jobs.order.retain(|id| !expired.contains(id));
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("The queue is shut down")]
    Closed,

    #[error("Job {0} was not found")]
    NotFound(JobId),

    #[error("Job {0} can not move from {1} to {2}")]
    Transition(JobId, JobState, JobState),
}

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("Job {0} is running and can only be waited on")]
    Running(JobId),

    #[error("Job {0} is not pending")]
    NotFound(JobId),
}
