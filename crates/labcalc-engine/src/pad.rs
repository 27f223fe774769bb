use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Volatile key of the per-run has-errors marker.
pub const HAS_ERRORS_KEY: &str = "calculation.has_errors";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadKind {
    Sample,
    Replicate,
    Acquisition,
    Cycle,
}

impl PadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Replicate => "replicate",
            Self::Acquisition => "acquisition",
            Self::Cycle => "cycle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Ok,
    Warning,
    Error,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub value: f64,
    pub sd: Option<f64>,
    pub se: Option<f64>,
    pub ci: Option<f64>,
    pub count: usize,
}

impl Accumulator {
    /// Mean, sample standard deviation, standard error and a 95% interval
    /// half-width (normal approximation) of `values`.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        if count == 1 {
            return Some(Self {
                value: mean,
                sd: None,
                se: None,
                ci: None,
                count,
            });
        }
        let variance = values
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / (count - 1) as f64;
        let sd = variance.sqrt();
        let se = sd / (count as f64).sqrt();
        Some(Self {
            value: mean,
            sd: Some(sd),
            se: Some(se),
            ci: Some(1.96 * se),
            count,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PadValue {
    Number(f64),
    Flag(bool),
    Text(String),
    Accumulator(Accumulator),
}

impl PadValue {
    /// Scalar reads unwrap an accumulator to its primary value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Accumulator(accumulator) => Some(accumulator.value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            Self::Number(value) => Some(*value != 0.0),
            Self::Accumulator(accumulator) => Some(accumulator.value != 0.0),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// One node of the hierarchical working record (sample, replicate,
/// acquisition or cycle).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    pub id: String,
    pub kind: PadKind,
    #[serde(default)]
    values: BTreeMap<String, PadValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<RecordStatus>,
    #[serde(default)]
    children: Vec<Pad>,
    #[serde(skip)]
    volatile: BTreeMap<String, Value>,
}

impl Pad {
    pub fn new(id: impl Into<String>, kind: PadKind) -> Self {
        Self {
            id: id.into(),
            kind,
            values: BTreeMap::new(),
            status: None,
            children: Vec::new(),
            volatile: BTreeMap::new(),
        }
    }

    pub fn replicate(id: impl Into<String>) -> Self {
        Self::new(id, PadKind::Replicate)
    }

    pub fn sample(id: impl Into<String>) -> Self {
        Self::new(id, PadKind::Sample)
    }

    pub fn with_value(mut self, column: impl Into<String>, value: PadValue) -> Self {
        self.set(column, value);
        self
    }

    pub fn with_number(self, column: impl Into<String>, value: f64) -> Self {
        self.with_value(column, PadValue::Number(value))
    }

    pub fn with_text(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_value(column, PadValue::Text(value.into()))
    }

    pub fn with_child(mut self, child: Pad) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn get(&self, column: &str) -> Option<&PadValue> {
        self.values.get(column)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(PadValue::as_f64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(PadValue::as_str)
    }

    pub fn set(&mut self, column: impl Into<String>, value: PadValue) {
        self.values.insert(column.into(), value);
    }

    pub fn set_number(&mut self, column: impl Into<String>, value: f64) {
        self.set(column, PadValue::Number(value));
    }

    pub fn set_accumulator(&mut self, column: impl Into<String>, accumulator: Accumulator) {
        self.set(column, PadValue::Accumulator(accumulator));
    }

    pub fn remove(&mut self, column: &str) -> Option<PadValue> {
        self.values.remove(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn has_all_columns(&self, required: &[String]) -> bool {
        required.iter().all(|column| self.values.contains_key(column))
    }

    pub fn missing_columns(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|column| !self.values.contains_key(column.as_str()))
            .cloned()
            .collect()
    }

    pub fn volatile(&self, key: &str) -> Option<&Value> {
        self.volatile.get(key)
    }

    pub fn set_volatile(&mut self, key: impl Into<String>, value: Value) {
        self.volatile.insert(key.into(), value);
    }

    pub fn clear_volatile(&mut self, key: &str) {
        self.volatile.remove(key);
    }

    pub fn has_errors(&self) -> bool {
        self.volatile(HAS_ERRORS_KEY).and_then(Value::as_bool) == Some(true)
    }

    pub fn status(&self) -> Option<RecordStatus> {
        self.status
    }

    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = Some(status);
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    pub fn children(&self) -> &[Pad] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Pad] {
        &mut self.children
    }

    /// Moves the children out, e.g. to run them through their own executor.
    pub fn take_children(&mut self) -> Vec<Pad> {
        std::mem::take(&mut self.children)
    }

    pub fn set_children(&mut self, children: Vec<Pad>) {
        self.children = children;
    }
}

pub fn load_pads_from_path(path: &Path) -> Result<Vec<Pad>, EngineError> {
    let raw = fs::read_to_string(path).map_err(|error| {
        EngineError::Config(format!(
            "failed to read records '{}': {}",
            path.display(),
            error
        ))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_pads_to_path(pads: &[Pad], path: &Path) -> Result<(), EngineError> {
    let json = serde_json::to_string_pretty(pads)?;
    fs::write(path, json).map_err(|error| {
        EngineError::Config(format!(
            "failed to write records '{}': {}",
            path.display(),
            error
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_f64_accumulator_expected_primary_value() {
        let mut pad = Pad::replicate("r1");
        pad.set_accumulator(
            "d13c",
            Accumulator {
                value: 1.25,
                sd: Some(0.1),
                se: None,
                ci: None,
                count: 4,
            },
        );
        assert_eq!(pad.get_f64("d13c"), Some(1.25));
    }

    #[test]
    fn has_all_columns_reports_missing() {
        let pad = Pad::replicate("r1").with_number("a", 1.0);
        let required = vec!["a".to_string(), "b".to_string()];
        assert!(!pad.has_all_columns(&required));
        assert_eq!(pad.missing_columns(&required), vec!["b".to_string()]);
        assert!(pad.has_all_columns(&required[..1]));
    }

    #[test]
    fn volatile_data_expected_not_serialized() {
        let mut pad = Pad::replicate("r1").with_number("a", 1.0);
        pad.set_volatile(HAS_ERRORS_KEY, json!(true));
        assert!(pad.has_errors());

        let json = serde_json::to_string(&pad).expect("pad should serialize");
        assert!(!json.contains(HAS_ERRORS_KEY));
        let restored: Pad = serde_json::from_str(&json).expect("pad should deserialize");
        assert!(!restored.has_errors());
        assert_eq!(restored.get_f64("a"), Some(1.0));
    }

    #[test]
    fn accumulator_from_values_expected_mean_sd_and_interval() {
        let accumulator =
            Accumulator::from_values(&[1.0, 2.0, 3.0]).expect("accumulator should exist");
        assert_eq!(accumulator.value, 2.0);
        assert_eq!(accumulator.count, 3);
        let sd = accumulator.sd.expect("sd should exist");
        assert!((sd - 1.0).abs() < 1e-12);
        let se = accumulator.se.expect("se should exist");
        assert!((se - 1.0 / 3f64.sqrt()).abs() < 1e-12);
        assert!(Accumulator::from_values(&[]).is_none());
        assert_eq!(
            Accumulator::from_values(&[5.0]).expect("single value").sd,
            None
        );
    }

    #[test]
    fn pad_value_as_bool_accepts_numbers() {
        assert_eq!(PadValue::Number(0.0).as_bool(), Some(false));
        assert_eq!(PadValue::Number(2.0).as_bool(), Some(true));
        assert_eq!(PadValue::Text("yes".to_string()).as_bool(), None);
    }
}
