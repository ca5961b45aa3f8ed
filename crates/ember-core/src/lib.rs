//! Runtime core of the Ember notebook kernel.
//!
//! This crate provides:
//! - Single-slot execution scheduler with cooperative-then-forced interrupts
//! - Background job facility for requests that must not wait on execution
//! - Output capture turning raw writes into bounded chunks
//! - Registry of live in-memory results
//! - The evaluator capability and a built-in calculator evaluator

pub mod capture;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod execute;
pub mod io;
pub mod registry;

pub use capture::{CaptureWriter, CapturedChunk, ChunkSink, OutputCapture, StreamKind};
pub use config::{OutputConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use evaluator::{
    CompletenessStatus, CompletionResult, Diagnostic, DisplayData, EvalOutcome, EvalRequest,
    EvalValue, Evaluator, LanguageInfo, Renderable, Severity,
};
pub use execute::{
    ExecutionResult, ExecutionScheduler, Fault, InterruptHandle, InterruptOutcome, JobLauncher,
    TaskContext,
};
pub use io::{DisabledStdin, DisplaySink, ExecutionIo, StdinSource};
pub use registry::{AnyValue, InMemoryRegistry, NoOpRegistry, ResultRegistry};
