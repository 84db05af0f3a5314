//! Error types for the scheduler.

use thiserror::Error;

/// Structural misconfiguration surfaced to callers of `add_job` / `start`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job was registered without a schedule expression.
    #[error("unable to add job {name:?} with an empty schedule")]
    EmptySchedule { name: String },

    /// `start` was called before any job was registered.
    #[error("unable to start an empty scheduler")]
    EmptyScheduler,

    /// The trigger engine rejected the schedule expression.
    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure of a single run. Captured into the run's [`Execution`], never
/// propagated past the wrapper.
///
/// [`Execution`]: crate::Execution
#[derive(Debug, Error)]
pub enum JobError {
    /// The process ran to completion but reported failure.
    #[error("error non-zero exit code: {code}")]
    NonZeroExit { code: i32 },

    /// The process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run outlived its allowed wall-clock budget and was killed.
    #[error("job exceeded its maximum running time of {secs}s")]
    MaxTimeRunning { secs: u64 },

    /// The process ended without an exit code (e.g. killed by a signal).
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// The job body or a middleware panicked.
    #[error("run panicked: {0}")]
    Panicked(String),

    /// Free-form failure reported by a job body or middleware.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobError::Failed(reason.into())
    }
}
