//! The relational store for the retention policy, audit log and stored credential.
//!

use std::{
    fs, io,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS retention_policy (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    enabled     INTEGER NOT NULL,
    targets     TEXT    NOT NULL,
    mode        TEXT    NOT NULL,
    weekday     INTEGER,
    hour        INTEGER NOT NULL,
    keep        INTEGER NOT NULL,
    next_run    INTEGER,
    last_run    INTEGER
);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    operation   TEXT    NOT NULL,
    target      TEXT    NOT NULL,
    status      TEXT    NOT NULL,
    detail      TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS audit_log_timestamp ON audit_log (timestamp);

CREATE TABLE IF NOT EXISTS stored_credential (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    ciphertext  TEXT    NOT NULL,
    endpoint    TEXT    NOT NULL,
    bucket      TEXT    NOT NULL,
    region      TEXT    NOT NULL,
    updated_at  INTEGER NOT NULL
);
";

/// A single SQLite connection guarded by a lock.
///
/// Every statement is short, so the lock is only held for the statement itself.
pub struct Database {
    connection: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(DatabaseError::CreateDirectory)?;
        }

        let connection = Connection::open(path)?;
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        Self::with_connection(connection)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self, DatabaseError> {
        connection.execute_batch(SCHEMA)?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Lock the connection.
    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convert a timestamp to its stored form.
pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert a stored timestamp back, clamping corrupt values to the epoch.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to create the data directory:\n{0}")]
    CreateDirectory(#[source] io::Error),

    #[error("Database error:\n{0}")]
    Sqlite(#[from] rusqlite::Error),
}
