//! Asynchronous reference-data dependencies of a step.
//!
//! A step that needs externally owned data (mass spectrometer identity,
//! correction interval membership, acid temperature, sample and standard
//! identity) hands the executor a [`DependencyManager`] holding one
//! [`DependencyPlugin`] per piece of data. The manager asks an injected
//! [`ReferenceSource`] for each key; the source either answers at once or
//! hands back a [`RequestId`] that the host later completes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub mod manager;
pub mod plugin;

pub use manager::DependencyManager;
pub use plugin::{ReferencePlugin, SampleStandardPlugin};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    MassSpec,
    CorrectionInterval,
    AcidTemperature,
    Sample,
    Standard,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MassSpec => "mass_spec",
            Self::CorrectionInterval => "correction_interval",
            Self::AcidTemperature => "acid_temperature",
            Self::Sample => "sample",
            Self::Standard => "standard",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyKey {
    pub kind: ReferenceKind,
    pub id: String,
}

impl DependencyKey {
    pub fn new(kind: ReferenceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Answer of a reference source to one key.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
    Ready(Value),
    Pending(RequestId),
    Failed(String),
}

pub trait ReferenceSource: Send + Sync {
    fn lookup(&self, key: &DependencyKey) -> Lookup;
}

pub type SharedReferenceSource = Arc<dyn ReferenceSource>;

/// Source used when nothing was configured: every lookup fails.
#[derive(Debug, Default)]
pub struct NoReferenceSource;

impl ReferenceSource for NoReferenceSource {
    fn lookup(&self, key: &DependencyKey) -> Lookup {
        Lookup::Failed(format!("no reference source configured for {key}"))
    }
}

/// Change pushed by an external cache after a value was handed out.
/// `value == None` means the object was deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct DependencyChange {
    pub key: DependencyKey,
    pub value: Option<Value>,
}

impl DependencyChange {
    pub fn updated(key: DependencyKey, value: Value) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn deleted(key: DependencyKey) -> Self {
        Self { key, value: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluginState {
    Loading,
    Loaded,
    Error(String),
}

impl PluginState {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

pub trait DependencyPlugin: Send {
    fn name(&self) -> &str;

    /// First key to fetch, or `None` when the value is already resolvable.
    fn request_object(&mut self) -> Option<DependencyKey>;

    /// Feeds a fetched value back. A returned key is a chained follow-up
    /// fetch.
    fn received_object(&mut self, value: Value) -> Option<DependencyKey>;

    fn fail(&mut self, message: String);

    fn state(&self) -> PluginState;

    fn value(&self) -> Option<&Value>;

    /// Non-fatal data-quality notices attached to the fetched data.
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_no_longer_valid(&self, change: &DependencyChange) -> bool;
}

/// Reads `warnings: [..]` notices off a fetched reference object.
pub(crate) fn warnings_of(value: &Value) -> Vec<String> {
    value
        .get("warnings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
