use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A user-configured pipeline: an ordered list of steps plus their
/// position-keyed parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub params: Vec<StepParams>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub position: u32,
    pub step_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub formats: BTreeMap<String, String>,
}

impl StepConfig {
    pub fn new(position: u32, step_type: impl Into<String>) -> Self {
        Self {
            position,
            step_type: step_type.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, label: impl Into<String>, column: impl Into<String>) -> Self {
        self.inputs.insert(label.into(), column.into());
        self
    }

    pub fn output(mut self, label: impl Into<String>, column: impl Into<String>) -> Self {
        self.outputs.insert(label.into(), column.into());
        self
    }

    pub fn format(mut self, label: impl Into<String>, format: impl Into<String>) -> Self {
        self.formats.insert(label.into(), format.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    pub position: u32,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl StepParams {
    pub fn new(position: u32) -> Self {
        Self {
            position,
            values: Map::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }
}

impl Analysis {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_params(mut self, params: StepParams) -> Self {
        self.params.push(params);
        self
    }

    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            EngineError::Config(format!(
                "failed to read analysis '{}': {}",
                path.display(),
                error
            ))
        })?;
        let analysis: Self = serde_json::from_str(&raw)?;
        if analysis.id.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "analysis '{}' has an empty id",
                path.display()
            )));
        }
        Ok(analysis)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                EngineError::Config(format!(
                    "failed to create analysis directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|error| {
            EngineError::Config(format!(
                "failed to write analysis '{}': {}",
                path.display(),
                error
            ))
        })
    }

    /// Content hash of the step and parameter configuration. Two analyses
    /// with the same fingerprint compile to the same pipeline.
    pub fn fingerprint(&self) -> Result<String, EngineError> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|step| step.position);
        let mut params = self.params.clone();
        params.sort_by_key(|params| params.position);
        let canonical = serde_json::to_vec(&(&self.id, steps, params))?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
}
