//! Task outcomes.

use std::any::Any;

use serde::{Deserialize, Serialize};

/// Kind used for faults produced by a panicking task body.
pub const PANIC_FAULT_KIND: &str = "panic";

/// Kind used for the interruption signal.
pub const INTERRUPTED_FAULT_KIND: &str = "Interrupted";

/// A fault raised while running a task body.
///
/// Faults are values rather than errors: they are captured by the worker,
/// classified, and surfaced to the front-end with their kind, message and
/// trace intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    /// Fault class name (e.g. `DivisionByZero`).
    pub kind: String,
    /// Human readable message.
    pub message: String,
    /// Textual trace, outermost frame first.
    #[serde(default)]
    pub trace: Vec<String>,
    #[serde(default)]
    interruption: bool,
}

impl Fault {
    /// Create an ordinary fault.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
            interruption: false,
        }
    }

    /// The interruption signal.
    pub fn interrupted() -> Self {
        Self {
            kind: INTERRUPTED_FAULT_KIND.to_string(),
            message: "The execution was interrupted".to_string(),
            trace: Vec::new(),
            interruption: true,
        }
    }

    /// Attach a trace.
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    /// Whether this fault is the interruption signal.
    pub fn is_interruption(&self) -> bool {
        self.interruption
    }

    /// Convert a panic payload into a fault.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(PANIC_FAULT_KIND, message)
    }
}

/// Outcome of one scheduled task. Produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult<T> {
    /// The body returned a value.
    Success(T),
    /// The body raised an ordinary fault.
    Failure(Fault),
    /// The body was interrupted, cooperatively or by abandonment.
    Interrupted,
}

impl<T> ExecutionResult<T> {
    /// Classify a body outcome. Interruption faults become `Interrupted`.
    pub fn from_outcome(outcome: Result<T, Fault>) -> Self {
        match outcome {
            Ok(value) => Self::Success(value),
            Err(fault) if fault.is_interruption() => Self::Interrupted,
            Err(fault) => Self::Failure(fault),
        }
    }

    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the task was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        match self {
            Self::Success(value) => ExecutionResult::Success(f(value)),
            Self::Failure(fault) => ExecutionResult::Failure(fault),
            Self::Interrupted => ExecutionResult::Interrupted,
        }
    }
}
