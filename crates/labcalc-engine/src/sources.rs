//! Reference sources handed to executors, and async fetchers used by the
//! driver loop.

use crate::{DependencyKey, EngineError, Lookup, ReferenceKind, ReferenceSource, RequestId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Snapshot of reference objects keyed by kind and id. Answers every
/// lookup at once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryReferenceSource {
    entries: BTreeMap<DependencyKey, Value>,
}

impl MemoryReferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ReferenceKind, id: impl Into<String>, value: Value) -> Self {
        self.insert(DependencyKey::new(kind, id), value);
        self
    }

    pub fn insert(&mut self, key: DependencyKey, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &DependencyKey) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &DependencyKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads `{ "<kind>": { "<id>": <object>, ... }, ... }`.
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            EngineError::Config(format!(
                "failed to read references '{}': {}",
                path.display(),
                error
            ))
        })?;
        let grouped: BTreeMap<ReferenceKind, BTreeMap<String, Value>> =
            serde_json::from_str(&raw)?;
        let entries = grouped
            .into_iter()
            .flat_map(|(kind, objects)| {
                objects
                    .into_iter()
                    .map(move |(id, value)| (DependencyKey::new(kind, id), value))
            })
            .collect();
        Ok(Self { entries })
    }
}

impl ReferenceSource for MemoryReferenceSource {
    fn lookup(&self, key: &DependencyKey) -> Lookup {
        match self.entries.get(key) {
            Some(value) => Lookup::Ready(value.clone()),
            None => Lookup::Failed(format!("reference {key} not found")),
        }
    }
}

/// Source that never answers synchronously: every lookup is queued and
/// handed back as a pending request for the host to complete.
#[derive(Debug, Default)]
pub struct QueuedReferenceSource {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    requested: Vec<(RequestId, DependencyKey)>,
}

impl QueuedReferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key requested so far, in request order.
    pub fn requested(&self) -> Vec<(RequestId, DependencyKey)> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requested
            .clone()
    }
}

impl ReferenceSource for QueuedReferenceSource {
    fn lookup(&self, key: &DependencyKey) -> Lookup {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_id += 1;
        let request_id = RequestId(state.next_id);
        state.requested.push((request_id, key.clone()));
        Lookup::Pending(request_id)
    }
}

#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(&self, key: &DependencyKey) -> Result<Value, String>;
}

/// Fetcher backed by an in-memory snapshot, with an optional artificial
/// latency per request.
#[derive(Clone, Debug, Default)]
pub struct MemoryReferenceFetcher {
    source: MemoryReferenceSource,
    delay: Option<Duration>,
}

impl MemoryReferenceFetcher {
    pub fn new(source: MemoryReferenceSource) -> Self {
        Self {
            source,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ReferenceFetcher for MemoryReferenceFetcher {
    async fn fetch(&self, key: &DependencyKey) -> Result<Value, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.source
            .get(key)
            .cloned()
            .ok_or_else(|| format!("reference {key} not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_source_lookup_expected_ready_or_failed() {
        let source =
            MemoryReferenceSource::new().with(ReferenceKind::MassSpec, "ms1", json!({"background": 2.0}));
        assert_eq!(
            source.lookup(&DependencyKey::new(ReferenceKind::MassSpec, "ms1")),
            Lookup::Ready(json!({"background": 2.0}))
        );
        assert!(matches!(
            source.lookup(&DependencyKey::new(ReferenceKind::MassSpec, "ms2")),
            Lookup::Failed(_)
        ));
    }

    #[test]
    fn memory_source_load_from_path_groups_by_kind() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("references.json");
        fs::write(
            &path,
            r#"{"mass_spec": {"ms1": {"background": 1.5}}, "acid_temperature": {"a1": {"temperature": 25.0}}}"#,
        )
        .expect("references should be written");

        let source = MemoryReferenceSource::load_from_path(&path).expect("references should load");
        assert_eq!(source.len(), 2);
        assert_eq!(
            source.get(&DependencyKey::new(ReferenceKind::AcidTemperature, "a1")),
            Some(&json!({"temperature": 25.0}))
        );
    }

    #[test]
    fn queued_source_lookup_expected_fresh_pending_ids() {
        let source = QueuedReferenceSource::new();
        let key = DependencyKey::new(ReferenceKind::Sample, "s1");
        let first = source.lookup(&key);
        let second = source.lookup(&key);
        assert_eq!(first, Lookup::Pending(RequestId(1)));
        assert_eq!(second, Lookup::Pending(RequestId(2)));
        assert_eq!(source.requested().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_fetcher_missing_key_expected_error_message() {
        let fetcher = MemoryReferenceFetcher::new(MemoryReferenceSource::new())
            .with_delay(Duration::from_millis(1));
        let error = fetcher
            .fetch(&DependencyKey::new(ReferenceKind::Standard, "std"))
            .await
            .expect_err("missing key should fail");
        assert!(error.contains("standard:std"));
    }
}
