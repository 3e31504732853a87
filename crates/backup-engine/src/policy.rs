//! The retention policy: which targets are backed up on a schedule and how many scheduled
//! artifacts of each are kept.
//!

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use shared::{Schedule, ScheduleError, TargetName};
use thiserror::Error;

use crate::database::{Database, from_millis, to_millis};

/// The single installation-wide retention policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// If the scheduler fires at all.
    pub enabled: bool,

    /// The targets backed up on each scheduled run.
    pub targets: BTreeSet<TargetName>,

    /// When scheduled runs happen.
    pub schedule: Schedule,

    /// Scheduled artifacts kept per target.
    pub keep: u32,
}

impl RetentionPolicy {
    /// Ensure the policy can be applied.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.schedule.validate()?;

        if self.keep == 0 {
            return Err(PolicyError::Keep);
        }

        Ok(())
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            targets: BTreeSet::new(),
            schedule: Schedule::default(),
            keep: 7,
        }
    }
}

/// Reads and writes the stored policy and its run times.
pub struct PolicyStore {
    database: Arc<Database>,
}

impl PolicyStore {
    /// Create a store over the database.
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// The stored policy, or the default policy if none has been saved.
    pub fn load(&self) -> Result<RetentionPolicy, PolicyError> {
        let row = self
            .database
            .connection()
            .query_row(
                "SELECT enabled, targets, mode, weekday, hour, keep FROM retention_policy WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<u32>>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((enabled, targets, mode, weekday, hour, keep)) = row else {
            return Ok(RetentionPolicy::default());
        };

        Ok(RetentionPolicy {
            enabled,
            targets: serde_json::from_str(&targets)?,
            schedule: Schedule::from_columns(&mode, weekday, hour)?,
            keep,
        })
    }

    /// Validate and persist the policy along with its next run time.
    pub fn save(&self, policy: &RetentionPolicy, next_run: Option<DateTime<Utc>>) -> Result<(), PolicyError> {
        policy.validate()?;

        let targets = serde_json::to_string(&policy.targets)?;
        let (mode, weekday, hour) = policy.schedule.to_columns();

        self.database.connection().execute(
            "INSERT INTO retention_policy (id, enabled, targets, mode, weekday, hour, keep, next_run)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                enabled = excluded.enabled,
                targets = excluded.targets,
                mode = excluded.mode,
                weekday = excluded.weekday,
                hour = excluded.hour,
                keep = excluded.keep,
                next_run = excluded.next_run",
            params![
                policy.enabled,
                targets,
                mode,
                weekday,
                hour,
                policy.keep,
                next_run.map(to_millis)
            ],
        )?;

        Ok(())
    }

    /// The stored `(next_run, last_run)` times.
    pub fn run_times(&self) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), PolicyError> {
        let row = self
            .database
            .connection()
            .query_row(
                "SELECT next_run, last_run FROM retention_policy WHERE id = 1",
                [],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;

        Ok(row
            .map(|(next, last)| (next.map(from_millis), last.map(from_millis)))
            .unwrap_or_default())
    }

    /// Record that the run due at `due` fired at `last_run` and when the next one is due.
    /// Returns `false` without changing anything if the stored next run is no longer `due`.
    pub fn claim_run(
        &self,
        due: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool, PolicyError> {
        let changed = self.database.connection().execute(
            "UPDATE retention_policy SET last_run = ?1, next_run = ?2 WHERE id = 1 AND next_run = ?3",
            params![to_millis(last_run), next_run.map(to_millis), to_millis(due)],
        )?;

        Ok(changed == 1)
    }

    /// Store a recomputed next run time.
    pub fn set_next_run(&self, next_run: Option<DateTime<Utc>>) -> Result<(), PolicyError> {
        self.database.connection().execute(
            "UPDATE retention_policy SET next_run = ?1 WHERE id = 1",
            params![next_run.map(to_millis)],
        )?;

        Ok(())
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid schedule:\n{0}")]
    Schedule(#[from] ScheduleError),

    #[error("The keep count must be at least 1")]
    Keep,

    #[error("Failed to access the retention policy:\n{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored targets are corrupt:\n{0}")]
    Targets(#[from] serde_json::Error),
}
