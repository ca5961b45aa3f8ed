//! Turning evaluation results into reply payloads.

use std::panic::{AssertUnwindSafe, catch_unwind};

use ember_core::{
    DisplayData, EvalOutcome, EvalValue, ExecutionResult, Fault, ResultRegistry,
};
use serde_json::Value;

/// Abort message for interrupted executions.
pub const EXECUTION_INTERRUPTED_MESSAGE: &str = "The execution was interrupted";

/// Why a value could not be rendered.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{0}")]
    Custom(String),
    #[error("renderer panicked: {0}")]
    Panic(String),
}

/// Outcome of an execute request, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResponse {
    /// Finished, possibly with a value to show.
    Ok(Option<DisplayData>),
    /// Failed with a fault.
    Error(Fault),
    /// Interrupted, or the result could not be rendered.
    Abort(String),
}

impl ExecuteResponse {
    /// Classify a scheduled evaluation.
    ///
    /// Rendering runs here, and a failing renderer degrades the reply to an
    /// abort instead of taking the reply path down.
    pub fn from_result(
        result: ExecutionResult<EvalOutcome>,
        registry: &dyn ResultRegistry,
    ) -> Self {
        match result {
            ExecutionResult::Success(EvalOutcome::Value(value)) => {
                let rendered = catch_unwind(AssertUnwindSafe(|| render_value(value, registry)))
                    .unwrap_or_else(|payload| {
                        Err(RenderError::Panic(Fault::from_panic(payload).message))
                    });
                match rendered {
                    Ok(data) => Self::Ok(data),
                    Err(e) => {
                        tracing::warn!("result rendering failed: {}", e);
                        Self::Abort(format!("error:  Unable to convert result to a string: {}", e))
                    }
                }
            }
            ExecutionResult::Success(EvalOutcome::RenderedError(display)) => Self::Ok(Some(display)),
            ExecutionResult::Failure(fault) => Self::Error(fault),
            ExecutionResult::Interrupted => Self::Abort(EXECUTION_INTERRUPTED_MESSAGE.to_string()),
        }
    }
}

/// Render a value into a MIME bundle. `Unit` renders to nothing.
///
/// In-memory values are stored in `registry` and referenced from the bundle
/// by id under their MIME type.
pub fn render_value(
    value: EvalValue,
    registry: &dyn ResultRegistry,
) -> Result<Option<DisplayData>, RenderError> {
    let data = match value {
        EvalValue::Unit => return Ok(None),
        EvalValue::Text(text) => DisplayData::text(text),
        EvalValue::Json(json) => {
            let text = serde_json::to_string_pretty(&json)
                .map_err(|e| RenderError::Custom(e.to_string()))?;
            DisplayData::text(text).with("application/json", json)
        }
        EvalValue::Mime(data) => data,
        EvalValue::InMemory {
            fallback,
            mime_type,
            value,
            id,
        } => {
            let id = match id {
                Some(id) => {
                    registry.put(&id, value);
                    id
                }
                None => registry.generate(value),
            };
            DisplayData::text(fallback).with(mime_type, Value::String(id))
        }
        EvalValue::Custom(renderable) => renderable
            .render()
            .map_err(|e| RenderError::Custom(e.to_string()))?,
    };
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ember_core::{InMemoryRegistry, NoOpRegistry, Renderable};

    struct Broken;

    impl Renderable for Broken {
        fn render(&self) -> Result<DisplayData, Box<dyn std::error::Error + Send + Sync>> {
            Err("no renderer for Broken".into())
        }
    }

    struct Panicky;

    impl Renderable for Panicky {
        fn render(&self) -> Result<DisplayData, Box<dyn std::error::Error + Send + Sync>> {
            panic!("renderer exploded")
        }
    }

    fn ok(value: EvalValue) -> ExecutionResult<EvalOutcome> {
        ExecutionResult::Success(EvalOutcome::Value(value))
    }

    #[test]
    fn test_text_and_unit() {
        let registry = NoOpRegistry;
        assert_eq!(
            ExecuteResponse::from_result(ok(EvalValue::Unit), &registry),
            ExecuteResponse::Ok(None)
        );
        assert_eq!(
            ExecuteResponse::from_result(ok(EvalValue::Text("2".into())), &registry),
            ExecuteResponse::Ok(Some(DisplayData::text("2")))
        );
    }

    #[test]
    fn test_json_has_text_fallback() {
        let data = render_value(EvalValue::Json(serde_json::json!({"a": 1})), &NoOpRegistry)
            .unwrap()
            .unwrap();
        assert_eq!(data.data["application/json"]["a"], 1);
        assert!(data.data["text/plain"].as_str().unwrap().contains("\"a\""));
    }

    #[test]
    fn test_in_memory_value_is_registered() {
        let registry = InMemoryRegistry::new();
        let data = render_value(
            EvalValue::InMemory {
                fallback: "frame".into(),
                mime_type: "application/x-frame".into(),
                value: Arc::new(41u32),
                id: None,
            },
            &registry,
        )
        .unwrap()
        .unwrap();

        let id = data.data["application/x-frame"].as_str().unwrap().to_string();
        assert_eq!(data.data["text/plain"], "frame");
        let registry: &dyn ResultRegistry = &registry;
        assert_eq!(*registry.get::<u32>(&id).unwrap(), 41);
    }

    #[test]
    fn test_explicit_id_overwrites() {
        let registry = InMemoryRegistry::new();
        for n in [1u8, 2u8] {
            render_value(
                EvalValue::InMemory {
                    fallback: n.to_string(),
                    mime_type: "application/x-n".into(),
                    value: Arc::new(n),
                    id: Some("fixed".into()),
                },
                &registry,
            )
            .unwrap();
        }
        let registry: &dyn ResultRegistry = &registry;
        assert_eq!(registry.size(), 1);
        assert_eq!(*registry.get::<u8>("fixed").unwrap(), 2);
    }

    #[test]
    fn test_render_failure_degrades_to_abort() {
        let response = ExecuteResponse::from_result(ok(EvalValue::Custom(Box::new(Broken))), &NoOpRegistry);
        assert_eq!(
            response,
            ExecuteResponse::Abort(
                "error:  Unable to convert result to a string: no renderer for Broken".to_string()
            )
        );

        let response = ExecuteResponse::from_result(ok(EvalValue::Custom(Box::new(Panicky))), &NoOpRegistry);
        assert!(matches!(response, ExecuteResponse::Abort(msg) if msg.contains("renderer exploded")));
    }

    #[test]
    fn test_failure_and_interrupt() {
        let fault = Fault::new("Boom", "bad");
        assert_eq!(
            ExecuteResponse::from_result(ExecutionResult::Failure(fault.clone()), &NoOpRegistry),
            ExecuteResponse::Error(fault)
        );
        assert_eq!(
            ExecuteResponse::from_result(ExecutionResult::Interrupted, &NoOpRegistry),
            ExecuteResponse::Abort(EXECUTION_INTERRUPTED_MESSAGE.to_string())
        );
    }
}
