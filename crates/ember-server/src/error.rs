//! Error types for the Ember kernel server.

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Ember core error.
    #[error("Core error: {0}")]
    Core(#[from] ember_core::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid listen address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The kernel was asked to shut down while embedded in a host process.
    ///
    /// Raised on the control path in place of exiting the process.
    #[error("Kernel shutdown requested")]
    ShutdownRequested,

    /// A standalone kernel was asked to shut down.
    ///
    /// The transport exits the process with status 0 once the reply has been
    /// delivered.
    #[error("Kernel exit requested")]
    ExitRequested,

    /// The kernel has already stopped accepting messages.
    #[error("Kernel is stopped")]
    KernelStopped,
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
