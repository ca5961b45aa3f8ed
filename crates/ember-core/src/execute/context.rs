//! Per-task execution context and cooperative interruption.
//!
//! Every scheduled task receives a [`TaskContext`] describing what is running
//! and exposing the interruption signal the body is expected to poll.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::result::Fault;

/// Handle for cooperative interruption of a running task.
///
/// `InterruptHandle` is a thread-safe flag. It can be cloned and shared
/// across threads, and any clone can raise the interrupt which will be
/// visible to all other clones.
///
/// # Example
///
/// ```
/// use ember_core::execute::InterruptHandle;
///
/// let handle = InterruptHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_interrupted());
///
/// handle_clone.interrupt();
///
/// assert!(handle.is_interrupted());
/// ```
#[derive(Clone, Default, Debug)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Create a new, unraised handle.
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if an interrupt has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Request interruption.
    ///
    /// Cooperative: the body must observe `is_interrupted()` and unwind.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Clear the flag.
    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}

/// Identity and control surface of one scheduled task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: u64,
    name: String,
    context: Option<String>,
    interrupt: InterruptHandle,
}

impl TaskContext {
    pub(crate) fn new(id: u64, name: String, context: Option<String>) -> Self {
        Self {
            id,
            name,
            context,
            interrupt: InterruptHandle::new(),
        }
    }

    /// Scheduler-assigned task id, unique per scheduler.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human readable task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluator context token requested for this task, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether an interrupt was requested for this task.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    /// Return an interruption fault if an interrupt was requested.
    ///
    /// Intended for use with `?` at safe points inside long-running bodies.
    pub fn check_interrupted(&self) -> Result<(), Fault> {
        if self.is_interrupted() {
            Err(Fault::interrupted())
        } else {
            Ok(())
        }
    }

    /// A clone of the interrupt flag, for handing to helpers.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_handle_creation() {
        let handle = InterruptHandle::new();
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn test_interrupt_handle_clone_shares_state() {
        let handle = InterruptHandle::new();
        let clone = handle.clone();

        clone.interrupt();

        assert!(handle.is_interrupted());
        assert!(clone.is_interrupted());
    }

    #[test]
    fn test_interrupt_handle_reset() {
        let handle = InterruptHandle::default();
        handle.interrupt();
        assert!(handle.is_interrupted());

        handle.reset();
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn test_task_context_check_interrupted() {
        let ctx = TaskContext::new(7, "cell".to_string(), Some("loader-1".to_string()));
        assert_eq!(ctx.id(), 7);
        assert_eq!(ctx.name(), "cell");
        assert_eq!(ctx.context(), Some("loader-1"));
        assert!(ctx.check_interrupted().is_ok());

        ctx.interrupt_handle().interrupt();
        let fault = ctx.check_interrupted().unwrap_err();
        assert!(fault.is_interruption());
    }
}
