//! Append-only audit trail of every job transition and retention action.
//!

use core::{fmt, str::FromStr};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, params_from_iter, types::Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::database::{Database, from_millis, to_millis};

/// The operation an audit entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A backup job.
    Backup,
    /// A restore job.
    Restore,
    /// A retention deletion.
    Cleanup,
    /// An explicit user deletion.
    Delete,
}

impl Operation {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Cleanup => "cleanup",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            "cleanup" => Ok(Self::Cleanup),
            "delete" => Ok(Self::Delete),
            _ => Err(AuditError::Corrupt(format!("unknown operation '{s}'"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status an audit entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The operation began.
    Started,
    /// The operation finished successfully.
    Completed,
    /// The operation failed.
    Error,
}

impl AuditStatus {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(AuditError::Corrupt(format!("unknown status '{s}'"))),
        }
    }
}

/// An immutable audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Insertion order.
    pub id: i64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// What was done.
    pub operation: Operation,
    /// The target the operation concerned.
    pub target: String,
    /// How it went.
    pub status: AuditStatus,
    /// Free-form detail, such as the artifact name or the error.
    pub detail: String,
}

/// Filter for audit queries. Every field is optional and fields combine with AND.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    /// Only this operation.
    pub operation: Option<Operation>,
    /// Only this status.
    pub status: Option<AuditStatus>,
    /// Only this target.
    pub target: Option<String>,
    /// Entries at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Entries before this time.
    pub until: Option<DateTime<Utc>>,
    /// At most this many entries, newest first.
    pub limit: Option<usize>,
}

/// Entry counts over recent windows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Entries in the last 24 hours.
    pub last_24h: u64,
    /// Entries in the last 7 days.
    pub last_7d: u64,
    /// Error entries in the last 24 hours.
    pub errors_24h: u64,
    /// Error entries in the last 7 days.
    pub errors_7d: u64,
}

/// The audit log.
pub struct AuditLog {
    database: Arc<Database>,
}

impl AuditLog {
    /// Create an audit log backed by the database.
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Append an entry.
    pub fn record(
        &self,
        operation: Operation,
        target: &str,
        status: AuditStatus,
        detail: &str,
    ) -> Result<(), AuditError> {
        debug!("Audit {operation} {target} {}: {detail}", status.as_str());

        self.database.connection().execute(
            "INSERT INTO audit_log (timestamp, operation, target, status, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                to_millis(Utc::now()),
                operation.as_str(),
                target,
                status.as_str(),
                detail
            ],
        )?;

        Ok(())
    }

    /// Retrieve entries matching the filter, newest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut sql = String::from(
            "SELECT id, timestamp, operation, target, status, detail FROM audit_log WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(operation) = filter.operation {
            sql.push_str(" AND operation = ?");
            values.push(Value::Text(operation.as_str().to_string()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(target) = &filter.target {
            sql.push_str(" AND target = ?");
            values.push(Value::Text(target.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Integer(to_millis(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp < ?");
            values.push(Value::Integer(to_millis(until)));
        }

        sql.push_str(" ORDER BY id DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let connection = self.database.connection();
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp, operation, target, status, detail) = row?;
            entries.push(AuditEntry {
                id,
                timestamp: from_millis(timestamp),
                operation: operation.parse()?,
                target,
                status: status.parse()?,
                detail,
            });
        }

        Ok(entries)
    }

    /// Count entries in the last day and week, relative to `now`.
    pub fn stats(&self, now: DateTime<Utc>) -> Result<AuditStats, AuditError> {
        let day = to_millis(now - TimeDelta::days(1));
        let week = to_millis(now - TimeDelta::days(7));

        let connection = self.database.connection();
        let (last_24h, last_7d, errors_24h, errors_7d) = connection.query_row(
            "SELECT
                COALESCE(SUM(timestamp >= ?1), 0),
                COALESCE(SUM(timestamp >= ?2), 0),
                COALESCE(SUM(timestamp >= ?1 AND status = 'error'), 0),
                COALESCE(SUM(timestamp >= ?2 AND status = 'error'), 0)
             FROM audit_log",
            params![day, week],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let count = |value: i64| u64::try_from(value).unwrap_or_default();

        Ok(AuditStats {
            last_24h: count(last_24h),
            last_7d: count(last_7d),
            errors_24h: count(errors_24h),
            errors_7d: count(errors_7d),
        })
    }

    /// Permanently remove every entry, returning how many were removed.
    pub fn clear(&self) -> Result<usize, AuditError> {
        let removed = self.database.connection().execute("DELETE FROM audit_log", [])?;
        Ok(removed)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to access the audit log:\n{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Audit log entry is corrupt: {0}")]
    Corrupt(String),
}
