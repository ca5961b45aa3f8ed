//! Execution engine for the Ember kernel.
//!
//! # Architecture
//!
//! ```text
//! ProtocolDispatcher (shell thread)
//!     │
//!     ├── ExecutionScheduler::submit ──► bounded FIFO queue
//!     │                                     │
//!     │                                     └── worker thread (one task at a time)
//!     │                                             │
//!     │                                             └── body(&TaskContext) → ExecutionResult
//!     │
//!     └── JobLauncher::launch ──► tokio runtime (completion, diagnostics)
//!
//! ProtocolDispatcher (control thread)
//!     │
//!     └── ExecutionScheduler::interrupt_current
//!             ├── raise InterruptHandle, wait for the grace period
//!             └── abandon the worker and start a fresh one
//! ```
//!
//! # Module Structure
//!
//! - `context` - Task identity and cooperative interruption
//! - `jobs` - Unordered background jobs
//! - `result` - Faults and task outcomes
//! - `scheduler` - Single-slot scheduler

mod context;
mod jobs;
mod result;
mod scheduler;

pub use context::{InterruptHandle, TaskContext};
pub use jobs::JobLauncher;
pub use result::{ExecutionResult, Fault, INTERRUPTED_FAULT_KIND, PANIC_FAULT_KIND};
pub use scheduler::{ExecutionScheduler, InterruptOutcome};
