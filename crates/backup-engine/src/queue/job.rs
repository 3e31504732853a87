use core::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{ArtifactKind, TargetName};
use uuid::Uuid;

use crate::{audit::Operation, error::ErrorClass, snapshot::RestoreOptions};

/// Identifies a job for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// A new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The first eight characters, for log prefixes.
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a job is in its lifecycle.
///
/// `Queued -> Waiting -> Starting -> Running -> Complete | Error`. A job may skip `Waiting`
/// when nothing is ahead of it, and may fail while `Starting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, not yet looked at.
    Queued,
    /// Waiting for the execution slot.
    Waiting,
    /// Holds the execution slot and is being prepared.
    Starting,
    /// Executing.
    Running,
    /// Finished successfully.
    Complete,
    /// Failed.
    Error,
}

impl JobState {
    /// If the job will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// If the job holds the execution slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// If the job may still be cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Waiting)
    }

    /// If moving to `next` is a legal transition.
    pub fn can_become(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Waiting)
                | (Self::Queued, Self::Starting)
                | (Self::Waiting, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Error)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Error)
        )
    }

    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work a job performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobRequest {
    /// Back up a target.
    Backup {
        /// The target.
        target: TargetName,
        /// Manual or scheduled.
        kind: ArtifactKind,
    },

    /// Restore an artifact.
    Restore {
        /// The artifact name.
        artifact: String,
        /// The target the artifact belongs to.
        target: TargetName,
        /// Passed through to the restore applicator.
        options: RestoreOptions,
    },
}

impl JobRequest {
    /// The target the job concerns.
    pub fn target(&self) -> &TargetName {
        match self {
            Self::Backup { target, .. } | Self::Restore { target, .. } => target,
        }
    }

    /// The audited operation.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Backup { .. } => Operation::Backup,
            Self::Restore { .. } => Operation::Restore,
        }
    }

    /// The artifact kind, for backups.
    pub fn kind(&self) -> Option<ArtifactKind> {
        match self {
            Self::Backup { kind, .. } => Some(*kind),
            Self::Restore { .. } => None,
        }
    }
}

/// A point-in-time view of a job, for polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// The job.
    pub job_id: JobId,
    /// The target.
    pub target: TargetName,
    /// Backup or restore.
    pub operation: Operation,
    /// Manual or scheduled, for backups.
    pub kind: Option<ArtifactKind>,
    /// Current state.
    pub state: JobState,
    /// Latest progress message, or the error on failure.
    pub detail: String,
    /// The class of the failure, on error.
    pub error_class: Option<ErrorClass>,
    /// The artifact written or read.
    pub artifact: Option<String>,
    /// When the job was enqueued.
    pub requested_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}
