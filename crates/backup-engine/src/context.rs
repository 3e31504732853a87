use core::fmt::{self, Display};

use crate::queue::JobId;

/// Holds the context for the current job. Used for prefixing logs.
#[derive(Default, Debug, Clone)]
pub struct Context {
    /// The job being executed.
    pub job: Option<JobId>,
    /// The target and operation of the job.
    pub target: Option<(String, &'static str)>,
    /// The current stage.
    pub current_context: &'static str,
}

impl Context {
    /// Create a context for a job.
    pub fn for_job(job: JobId, target: impl Into<String>, operation: &'static str) -> Self {
        Self {
            job: Some(job),
            target: Some((target.into(), operation)),
            current_context: "",
        }
    }

    /// A context that is not tied to a job.
    pub fn named(current_context: &'static str) -> Self {
        Self {
            current_context,
            ..Default::default()
        }
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "[{}] ", job.short())?;
        }

        if let Some((target, operation)) = &self.target {
            write!(f, "[{target}/{operation}] ")?;
        }

        if !self.current_context.is_empty() {
            write!(f, "[{}] ", self.current_context)?;
        }

        Ok(())
    }
}
