use rhai::EvalAltResult;
use thiserror::Error;

use super::assert::AssertionFailure;

/// Name of the zero-argument function every pipeline script must define.
pub const ENTRY_POINT: &str = "pipeline";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not compile pipeline: {0}")]
    Compile(String),

    #[error("pipeline must define `fn {ENTRY_POINT}()` with no parameters")]
    PipelineNotFound,

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("could not run pipeline: {0}")]
    Runtime(String),
}

impl BridgeError {
    pub fn from_eval(err: &EvalAltResult) -> Self {
        if let EvalAltResult::ErrorRuntime(value, _) = root_cause(err) {
            if let Some(failure) = value.clone().try_cast::<AssertionFailure>() {
                return BridgeError::Assertion(failure.0);
            }
        }
        BridgeError::Runtime(err.to_string())
    }
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        other => other,
    }
}
