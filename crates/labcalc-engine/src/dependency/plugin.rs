use super::{
    DependencyChange, DependencyKey, DependencyPlugin, PluginState, ReferenceKind, warnings_of,
};
use serde_json::{Value, json};

/// Fetches one reference object by key.
#[derive(Clone, Debug)]
pub struct ReferencePlugin {
    name: String,
    key: Option<DependencyKey>,
    state: PluginState,
    value: Option<Value>,
}

impl ReferencePlugin {
    pub fn new(name: impl Into<String>, key: DependencyKey) -> Self {
        Self {
            name: name.into(),
            key: Some(key),
            state: PluginState::Loading,
            value: None,
        }
    }

    /// Plugin whose value is already known; no fetch is issued.
    pub fn resolved(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            key: None,
            state: PluginState::Loaded,
            value: Some(value),
        }
    }

    /// Plugin that cannot be fetched at all, e.g. the record has no
    /// identifier for it.
    pub fn unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            state: PluginState::Error(reason.into()),
            value: None,
        }
    }

    pub fn key(&self) -> Option<&DependencyKey> {
        self.key.as_ref()
    }
}

impl DependencyPlugin for ReferencePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_object(&mut self) -> Option<DependencyKey> {
        match self.state {
            PluginState::Loading => self.key.clone(),
            _ => None,
        }
    }

    fn received_object(&mut self, value: Value) -> Option<DependencyKey> {
        if value.is_null() {
            let key = self
                .key
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| self.name.clone());
            self.state = PluginState::Error(format!("reference {key} does not exist"));
            return None;
        }
        self.value = Some(value);
        self.state = PluginState::Loaded;
        None
    }

    fn fail(&mut self, message: String) {
        self.state = PluginState::Error(message);
    }

    fn state(&self) -> PluginState {
        self.state.clone()
    }

    fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    fn warnings(&self) -> Vec<String> {
        self.value.as_ref().map(warnings_of).unwrap_or_default()
    }

    fn is_no_longer_valid(&self, change: &DependencyChange) -> bool {
        self.state == PluginState::Loaded
            && self.key.as_ref() == Some(&change.key)
            && self.value.as_ref() != change.value.as_ref()
    }
}

/// Fetches a sample's identity and, when the sample is a standard, chains
/// to the standard's reference values. The resolved value is
/// `{"sample": .., "standard": ..}`.
#[derive(Clone, Debug)]
pub struct SampleStandardPlugin {
    name: String,
    sample_key: DependencyKey,
    standard_key: Option<DependencyKey>,
    sample: Option<Value>,
    standard: Option<Value>,
    combined: Option<Value>,
    state: PluginState,
}

impl SampleStandardPlugin {
    pub fn new(name: impl Into<String>, sample_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_key: DependencyKey::new(ReferenceKind::Sample, sample_id),
            standard_key: None,
            sample: None,
            standard: None,
            combined: None,
            state: PluginState::Loading,
        }
    }

    pub fn sample(&self) -> Option<&Value> {
        self.sample.as_ref()
    }

    pub fn standard(&self) -> Option<&Value> {
        self.standard.as_ref()
    }

    fn finish(&mut self) {
        self.combined = Some(json!({
            "sample": self.sample.clone().unwrap_or(Value::Null),
            "standard": self.standard.clone().unwrap_or(Value::Null),
        }));
        self.state = PluginState::Loaded;
    }
}

impl DependencyPlugin for SampleStandardPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_object(&mut self) -> Option<DependencyKey> {
        match self.state {
            PluginState::Loading if self.sample.is_none() => Some(self.sample_key.clone()),
            PluginState::Loading => self.standard_key.clone(),
            _ => None,
        }
    }

    fn received_object(&mut self, value: Value) -> Option<DependencyKey> {
        if value.is_null() {
            let missing = if self.sample.is_none() {
                self.sample_key.to_string()
            } else {
                self.standard_key
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            };
            self.state = PluginState::Error(format!("reference {missing} does not exist"));
            return None;
        }

        if self.sample.is_none() {
            let standard_id = value
                .get("standard_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            self.sample = Some(value);
            if let Some(standard_id) = standard_id {
                let key = DependencyKey::new(ReferenceKind::Standard, standard_id);
                self.standard_key = Some(key.clone());
                return Some(key);
            }
            self.finish();
            return None;
        }

        self.standard = Some(value);
        self.finish();
        None
    }

    fn fail(&mut self, message: String) {
        self.state = PluginState::Error(message);
    }

    fn state(&self) -> PluginState {
        self.state.clone()
    }

    fn value(&self) -> Option<&Value> {
        self.combined.as_ref()
    }

    fn warnings(&self) -> Vec<String> {
        let mut warnings = self.sample.as_ref().map(warnings_of).unwrap_or_default();
        warnings.extend(self.standard.as_ref().map(warnings_of).unwrap_or_default());
        warnings
    }

    fn is_no_longer_valid(&self, change: &DependencyChange) -> bool {
        if self.state != PluginState::Loaded {
            return false;
        }
        if change.key == self.sample_key {
            return self.sample.as_ref() != change.value.as_ref();
        }
        self.standard_key.as_ref() == Some(&change.key)
            && self.standard.as_ref() != change.value.as_ref()
    }
}
