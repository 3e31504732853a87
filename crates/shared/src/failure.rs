use tracing::{error, warn};

fn log_and_panic<Err: core::fmt::Display>(error: Err, message: &str) -> ! {
    error!("{message}: {error}");

    panic!("{message}: {error}");
}

/// Extension trait for results that cannot be propagated.
pub trait Failure<T> {
    /// Log an error and panic. Reserved for unrecoverable startup failures.
    fn or_log_and_panic(self, message: &str) -> T;

    /// Log an error as a warning and discard it.
    fn or_log(self, message: &str) -> Option<T>;
}

impl<T, E: core::fmt::Display> Failure<T> for Result<T, E> {
    fn or_log_and_panic(self, message: &str) -> T {
        match self {
            Ok(value) => value,
            Err(error) => log_and_panic(error, message),
        }
    }

    fn or_log(self, message: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                warn!("{message}: {error}");
                None
            }
        }
    }
}
