//! The evaluation capability the kernel drives.
//!
//! The kernel never compiles or runs code itself. It hands each request to an
//! [`Evaluator`] on the execution worker and turns what comes back into
//! replies. [`calc::Calculator`] is a small built-in implementation.

pub mod calc;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execute::{Fault, TaskContext};
use crate::io::ExecutionIo;

/// One execute request as seen by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    pub code: String,
    /// Counter value assigned to this request.
    pub execution_count: u64,
    pub store_history: bool,
    pub silent: bool,
}

/// A MIME bundle plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Id used to update this display later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

impl DisplayData {
    /// Plain text bundle.
    pub fn text(text: impl Into<String>) -> Self {
        Self::default().with("text/plain", Value::String(text.into()))
    }

    /// Add one MIME entry.
    pub fn with(mut self, mime_type: impl Into<String>, value: Value) -> Self {
        self.data.insert(mime_type.into(), value);
        self
    }

    pub fn with_display_id(mut self, id: impl Into<String>) -> Self {
        self.display_id = Some(id.into());
        self
    }
}

/// User-provided rendering that may fail.
pub trait Renderable: Send {
    fn render(&self) -> Result<DisplayData, Box<dyn std::error::Error + Send + Sync>>;
}

/// A value produced by a successful evaluation.
pub enum EvalValue {
    /// Nothing to show.
    Unit,
    Text(String),
    /// Rendered as `application/json` with a text fallback.
    Json(Value),
    Mime(DisplayData),
    /// A live object kept in the result registry.
    ///
    /// The bundle gets `fallback` as text and `mime_type → id`. Without an
    /// explicit `id` one is generated.
    InMemory {
        fallback: String,
        mime_type: String,
        value: Arc<dyn Any + Send + Sync>,
        id: Option<String>,
    },
    Custom(Box<dyn Renderable>),
}

impl fmt::Debug for EvalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "Unit"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Mime(data) => f.debug_tuple("Mime").field(data).finish(),
            Self::InMemory {
                fallback,
                mime_type,
                id,
                ..
            } => f
                .debug_struct("InMemory")
                .field("fallback", fallback)
                .field("mime_type", mime_type)
                .field("id", id)
                .finish_non_exhaustive(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// What an evaluation produced, short of a fault.
#[derive(Debug)]
pub enum EvalOutcome {
    Value(EvalValue),
    /// A failure the evaluator already rendered for display. Answered as a
    /// successful execution carrying the rendering.
    RenderedError(DisplayData),
}

/// Result of `is_complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompletenessStatus {
    Complete,
    Incomplete {
        #[serde(default)]
        indent: String,
    },
    Invalid,
}

/// Completion candidates for a cursor position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One problem found by `list_errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub severity: Severity,
    /// Character offsets into the code.
    pub start: usize,
    pub end: usize,
}

/// Language description for `kernel_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
}

/// Compiles and runs code on behalf of the kernel.
///
/// `eval` always runs on the execution worker. The other queries are served
/// from background jobs and may run concurrently with `eval`.
pub trait Evaluator: Send + Sync {
    fn language(&self) -> LanguageInfo;

    /// Run one request. Faults become error replies; a fault marked as an
    /// interruption becomes an abort.
    fn eval(
        &self,
        request: &EvalRequest,
        io: &mut ExecutionIo,
        task: &TaskContext,
    ) -> Result<EvalOutcome, Fault>;

    fn check_complete(&self, code: &str) -> CompletenessStatus;

    /// Candidates for the word ending at `cursor` (a character offset).
    fn complete(&self, code: &str, cursor: usize) -> CompletionResult;

    fn list_errors(&self, code: &str) -> Vec<Diagnostic>;

    /// Token identifying the evaluator's current context, if it has one.
    fn context_token(&self) -> Option<String> {
        None
    }

    /// Best-effort finalization before the kernel exits.
    fn on_shutdown(&self) {}
}
