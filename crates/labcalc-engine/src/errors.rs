use crate::CompileError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("invalid record set: {0}")]
    InvalidRecords(String),
    #[error("dependency error: {0}")]
    Dependency(String),
    #[error("executor has been disposed")]
    Disposed,
    #[error(transparent)]
    Compile(#[from] CompilationFailed),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Blocking compile errors surfaced when a caller asks for a runnable
/// pipeline.
#[derive(Debug, Error, Clone)]
#[error("pipeline '{analysis_id}' has {blocking_count} blocking compile error(s)")]
pub struct CompilationFailed {
    pub analysis_id: String,
    pub errors: Vec<CompileError>,
    pub blocking_count: usize,
}

impl CompilationFailed {
    pub fn new(analysis_id: impl Into<String>, errors: Vec<CompileError>) -> Self {
        let blocking_count = errors.iter().filter(|error| error.is_blocking()).count();
        Self {
            analysis_id: analysis_id.into(),
            errors,
            blocking_count,
        }
    }
}

/// Failure raised by a single step calculator. The executor converts it
/// into a `CalculationError`; it never aborts a run.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    #[error("missing input '{label}'")]
    MissingInput { label: String },
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("dependency '{0}' is not available")]
    MissingDependency(String),
    #[error("{0}")]
    Calculation(String),
}

impl StepError {
    pub fn calculation(message: impl Into<String>) -> Self {
        Self::Calculation(message.into())
    }

    pub fn missing_input(label: impl Into<String>) -> Self {
        Self::MissingInput {
            label: label.into(),
        }
    }
}
