use crate::{Accumulator, DependencyManager, Pad, PadValue, StepConfig, StepError, StepParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFamily {
    /// Runs on replicate records, one record at a time.
    Replicate,
    /// Runs on a sample record after all of its replicates resolved.
    Sample,
}

impl StepFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replicate => "replicate",
            Self::Sample => "sample",
        }
    }

    pub fn record_kind(self) -> crate::PadKind {
        match self {
            Self::Replicate => crate::PadKind::Replicate,
            Self::Sample => crate::PadKind::Sample,
        }
    }
}

/// The configured view of one step handed to its calculator: column
/// bindings by label plus the step's parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct StepBinding {
    pub position: u32,
    pub step_type: String,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub formats: BTreeMap<String, String>,
    pub params: Option<StepParams>,
}

impl StepBinding {
    pub fn new(step: &StepConfig, params: Option<StepParams>) -> Self {
        Self {
            position: step.position,
            step_type: step.step_type.clone(),
            inputs: step.inputs.clone(),
            outputs: step.outputs.clone(),
            formats: step.formats.clone(),
            params,
        }
    }

    /// Inputs are checked before outputs.
    pub fn label_to_column_name(&self, label: &str) -> Option<&str> {
        self.inputs
            .get(label)
            .or_else(|| self.outputs.get(label))
            .map(String::as_str)
    }

    pub fn value<'a>(&self, pad: &'a Pad, label: &str) -> Option<&'a PadValue> {
        self.label_to_column_name(label)
            .and_then(|column| pad.get(column))
    }

    pub fn get_double(&self, pad: &Pad, label: &str) -> Option<f64> {
        self.value(pad, label).and_then(PadValue::as_f64)
    }

    /// Missing or non-boolean values read as `false`.
    pub fn is_true(&self, pad: &Pad, label: &str) -> bool {
        self.value(pad, label)
            .and_then(PadValue::as_bool)
            .unwrap_or(false)
    }

    pub fn require_double(&self, pad: &Pad, label: &str) -> Result<f64, StepError> {
        self.get_double(pad, label)
            .ok_or_else(|| StepError::missing_input(label))
    }

    /// Writes `value` to the column bound to `label`. Unbound outputs are
    /// silently dropped.
    pub fn set_double(&self, pad: &mut Pad, label: &str, value: f64) {
        if let Some(column) = self.outputs.get(label) {
            pad.set_number(column.clone(), value);
        }
    }

    pub fn set_accumulator(&self, pad: &mut Pad, label: &str, accumulator: Accumulator) {
        if let Some(column) = self.outputs.get(label) {
            pad.set_accumulator(column.clone(), accumulator);
        }
    }

    pub fn param_f64(&self, name: &str, default: f64) -> f64 {
        self.params
            .as_ref()
            .and_then(|params| params.f64(name))
            .unwrap_or(default)
    }

    /// Like `param_f64`, but a value that is present and not a number is
    /// an error instead of falling back.
    pub fn try_param_f64(&self, name: &str, default: f64) -> Result<f64, StepError> {
        let Some(value) = self.params.as_ref().and_then(|params| params.get(name)) else {
            return Ok(default);
        };
        value.as_f64().ok_or_else(|| StepError::InvalidParameter {
            name: name.to_string(),
            reason: format!("expected a number, found {value}"),
        })
    }

    pub fn param_bool(&self, name: &str, default: bool) -> bool {
        self.params
            .as_ref()
            .and_then(|params| params.bool(name))
            .unwrap_or(default)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.as_ref().and_then(|params| params.str(name))
    }
}

pub fn target_pad(records: &[Pad], target: usize) -> Result<&Pad, StepError> {
    records
        .get(target)
        .ok_or_else(|| StepError::calculation(format!("record index {target} is out of range")))
}

pub fn target_pad_mut(records: &mut [Pad], target: usize) -> Result<&mut Pad, StepError> {
    records
        .get_mut(target)
        .ok_or_else(|| StepError::calculation(format!("record index {target} is out of range")))
}

pub trait StepCalculator: Send + Sync {
    fn binding(&self) -> &StepBinding;

    /// Mutates `records[target]` (and, for context steps, may read any
    /// record of the set).
    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError>;

    /// Dependencies to fetch before `calculate`; `None` when the step
    /// needs no external data.
    fn dependency_manager(&self, _records: &[Pad], _target: usize) -> Option<DependencyManager> {
        None
    }
}

pub trait ReplicateCalculator: StepCalculator {
    /// Relevant when building a shared correction-interval context.
    fn applies_to_context(&self) -> bool {
        true
    }

    /// Relevant when computing a single record's displayed results.
    fn applies_to_results(&self) -> bool {
        true
    }
}

pub trait SampleCalculator: StepCalculator {}

/// A runnable step calculator, tagged by the record family it runs on.
pub enum StepRuntime {
    Replicate(Box<dyn ReplicateCalculator>),
    Sample(Box<dyn SampleCalculator>),
}

impl std::fmt::Debug for StepRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(self.family().as_str())
            .field(&self.binding().step_type)
            .field(&self.binding().position)
            .finish()
    }
}

impl StepRuntime {
    pub fn replicate(calculator: impl ReplicateCalculator + 'static) -> Self {
        Self::Replicate(Box::new(calculator))
    }

    pub fn sample(calculator: impl SampleCalculator + 'static) -> Self {
        Self::Sample(Box::new(calculator))
    }

    pub fn family(&self) -> StepFamily {
        match self {
            Self::Replicate(_) => StepFamily::Replicate,
            Self::Sample(_) => StepFamily::Sample,
        }
    }

    pub fn binding(&self) -> &StepBinding {
        match self {
            Self::Replicate(calculator) => calculator.binding(),
            Self::Sample(calculator) => calculator.binding(),
        }
    }

    pub fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        match self {
            Self::Replicate(calculator) => calculator.calculate(records, target, dependencies),
            Self::Sample(calculator) => calculator.calculate(records, target, dependencies),
        }
    }

    pub fn dependency_manager(&self, records: &[Pad], target: usize) -> Option<DependencyManager> {
        match self {
            Self::Replicate(calculator) => calculator.dependency_manager(records, target),
            Self::Sample(calculator) => calculator.dependency_manager(records, target),
        }
    }

    /// Sample steps always apply in their own run mode.
    pub fn applies_to_context(&self) -> bool {
        match self {
            Self::Replicate(calculator) => calculator.applies_to_context(),
            Self::Sample(_) => true,
        }
    }

    pub fn applies_to_results(&self) -> bool {
        match self {
            Self::Replicate(calculator) => calculator.applies_to_results(),
            Self::Sample(_) => true,
        }
    }
}
