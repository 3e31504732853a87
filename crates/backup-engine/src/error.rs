//! Error classification shared by every fallible engine operation.
//!

use core::fmt;

use serde::Serialize;

/// The class of a failure, deciding how the engine reacts to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorClass {
    /// Transient I/O failure. Retryable by enqueueing the job again, never retried inside a
    /// running job.
    Io,

    /// The storage credentials were rejected.
    Auth,

    /// The artifact was missing when it was read or deleted.
    NotFound,

    /// An artifact and its sidecar disagree.
    Consistency,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "IOError",
            Self::Auth => "AuthError",
            Self::NotFound => "NotFound",
            Self::Consistency => "ConsistencyError",
        };
        f.write_str(name)
    }
}

/// Errors that can be placed in the engine's failure taxonomy.
pub trait Classify {
    /// The class of this error.
    fn class(&self) -> ErrorClass;
}
