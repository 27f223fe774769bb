use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileErrorKind {
    EmptyPipeline,
    UnknownStepType,
    CalculatorConstruction,
    UnboundRequiredInput,
    DuplicatePosition,
    DuplicateParams,
}

impl CompileErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPipeline => "empty_pipeline",
            Self::UnknownStepType => "unknown_step_type",
            Self::CalculatorConstruction => "calculator_construction",
            Self::UnboundRequiredInput => "unbound_required_input",
            Self::DuplicatePosition => "duplicate_position",
            Self::DuplicateParams => "duplicate_params",
        }
    }

    /// Blocking errors make the pipeline unrunnable. The others only
    /// disable the affected step.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::EmptyPipeline | Self::DuplicatePosition | Self::DuplicateParams
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub position: Option<u32>,
    pub step_type: Option<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
            step_type: None,
        }
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.kind.is_blocking()
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.position, self.step_type.as_deref()) {
            (Some(position), Some(step_type)) => write!(
                f,
                "[{}] step {} ({}): {}",
                self.kind.as_str(),
                position,
                step_type,
                self.message
            ),
            (Some(position), None) => {
                write!(f, "[{}] step {}: {}", self.kind.as_str(), position, self.message)
            }
            _ => write!(f, "[{}] {}", self.kind.as_str(), self.message),
        }
    }
}
