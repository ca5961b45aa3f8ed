//! Error types for ember-core.

use thiserror::Error;

/// Result type for ember-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ember-core.
///
/// These are kernel-side failures. Faults raised by user code while a task
/// runs are not errors here; they are carried as [`crate::Fault`] values
/// inside an [`crate::ExecutionResult`].
#[derive(Debug, Error)]
pub enum Error {
    /// The scheduler was closed before the task could be queued or finished.
    #[error("execution scheduler is closed")]
    SchedulerClosed,

    /// The worker thread could not be started.
    #[error("failed to spawn execution worker: {0}")]
    WorkerSpawn(String),

    /// No tokio runtime is available for background jobs.
    #[error("job runtime unavailable: {0}")]
    JobRuntime(String),

    /// Reading from stdin is not permitted for the current request.
    #[error("Input from stdin is unsupported by the client")]
    StdinDisabled,

    /// The pending stdin read was abandoned (request finished or kernel closed).
    #[error("stdin read was cancelled")]
    StdinCancelled,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
