use super::{
    DependencyChange, DependencyKey, DependencyPlugin, Lookup, PluginState, ReferenceSource,
    RequestId,
};
use serde_json::Value;
use std::collections::BTreeMap;

const MAX_CHAIN_DEPTH: usize = 16;

/// Dependencies of one (step, record) pair. Owned by the executor that
/// created it and dropped at `dispose()`.
#[derive(Default)]
pub struct DependencyManager {
    plugins: Vec<Box<dyn DependencyPlugin>>,
    pending: BTreeMap<RequestId, (usize, DependencyKey)>,
    fetch_started: bool,
    disposed: bool,
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("pending", &self.pending)
            .field("fetch_started", &self.fetch_started)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: impl DependencyPlugin + 'static) -> Self {
        self.add_plugin(Box::new(plugin));
        self
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn DependencyPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Issues the first request of every plugin. Calling it again is a
    /// no-op.
    pub fn fetch(&mut self, source: &dyn ReferenceSource) {
        if self.fetch_started || self.disposed {
            return;
        }
        self.fetch_started = true;
        for index in 0..self.plugins.len() {
            let next = self.plugins[index].request_object();
            self.dispatch(index, next, source);
        }
    }

    /// Completes a pending request. Returns `false` when the id does not
    /// belong to this manager.
    pub fn receive(
        &mut self,
        request_id: RequestId,
        lookup: Lookup,
        source: &dyn ReferenceSource,
    ) -> bool {
        if self.disposed {
            return false;
        }
        let Some((index, key)) = self.pending.remove(&request_id) else {
            return false;
        };
        match lookup {
            Lookup::Ready(value) => {
                let next = self.plugins[index].received_object(value);
                self.dispatch(index, next, source);
            }
            Lookup::Pending(next_id) => {
                self.pending.insert(next_id, (index, key));
            }
            Lookup::Failed(message) => self.plugins[index].fail(message),
        }
        true
    }

    fn dispatch(
        &mut self,
        index: usize,
        mut next: Option<DependencyKey>,
        source: &dyn ReferenceSource,
    ) {
        let mut depth = 0;
        while let Some(key) = next.take() {
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                self.plugins[index].fail(format!(
                    "dependency chain exceeded {MAX_CHAIN_DEPTH} fetches at {key}"
                ));
                return;
            }
            match source.lookup(&key) {
                Lookup::Ready(value) => next = self.plugins[index].received_object(value),
                Lookup::Pending(request_id) => {
                    tracing::trace!(%key, request = request_id.0, "dependency fetch pending");
                    self.pending.insert(request_id, (index, key));
                }
                Lookup::Failed(message) => self.plugins[index].fail(message),
            }
        }
    }

    pub fn pending_requests(&self) -> Vec<(RequestId, DependencyKey)> {
        self.pending
            .iter()
            .map(|(request_id, (_, key))| (*request_id, key.clone()))
            .collect()
    }

    pub fn all_dependencies_are_loaded(&self) -> bool {
        self.fetch_started
            && self.pending.is_empty()
            && self
                .plugins
                .iter()
                .all(|plugin| plugin.state() != PluginState::Loading)
    }

    pub fn all_dependencies_are_valid(&self) -> bool {
        self.plugins.iter().all(|plugin| !plugin.state().is_error())
    }

    /// `(plugin name, message)` for every plugin in error state.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.plugins
            .iter()
            .filter_map(|plugin| match plugin.state() {
                PluginState::Error(message) => Some((plugin.name().to_string(), message)),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.warnings())
            .collect()
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name() == name)
            .and_then(|plugin| plugin.value())
    }

    pub fn is_no_longer_valid(&self, change: &DependencyChange) -> bool {
        !self.disposed
            && self
                .plugins
                .iter()
                .any(|plugin| plugin.is_no_longer_valid(change))
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.pending.clear();
        self.plugins.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{ReferenceKind, ReferencePlugin, SampleStandardPlugin};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers `Ready` for known keys, `Pending` for everything else.
    #[derive(Default)]
    struct ScriptedSource {
        ready: BTreeMap<DependencyKey, Value>,
        next_id: Mutex<u64>,
    }

    impl ReferenceSource for ScriptedSource {
        fn lookup(&self, key: &DependencyKey) -> Lookup {
            if let Some(value) = self.ready.get(key) {
                return Lookup::Ready(value.clone());
            }
            let mut next_id = self.next_id.lock().expect("id mutex should lock");
            *next_id += 1;
            Lookup::Pending(RequestId(*next_id))
        }
    }

    fn ms_key() -> DependencyKey {
        DependencyKey::new(ReferenceKind::MassSpec, "ms-1")
    }

    #[test]
    fn fetch_ready_source_expected_loaded_and_valid() {
        let mut source = ScriptedSource::default();
        source.ready.insert(ms_key(), json!({ "background": 0.5 }));
        let mut manager =
            DependencyManager::new().with_plugin(ReferencePlugin::new("mass_spec", ms_key()));

        assert!(!manager.all_dependencies_are_loaded());
        manager.fetch(&source);
        assert!(manager.all_dependencies_are_loaded());
        assert!(manager.all_dependencies_are_valid());
        assert_eq!(
            manager.value("mass_spec"),
            Some(&json!({ "background": 0.5 }))
        );
    }

    #[test]
    fn fetch_pending_then_receive_expected_loaded() {
        let source = ScriptedSource::default();
        let mut manager =
            DependencyManager::new().with_plugin(ReferencePlugin::new("mass_spec", ms_key()));
        manager.fetch(&source);

        let pending = manager.pending_requests();
        assert_eq!(pending, vec![(RequestId(1), ms_key())]);
        assert!(!manager.all_dependencies_are_loaded());

        assert!(!manager.receive(RequestId(99), Lookup::Ready(json!({})), &source));
        assert!(manager.receive(
            RequestId(1),
            Lookup::Ready(json!({ "background": 0.1 })),
            &source
        ));
        assert!(manager.all_dependencies_are_loaded());
    }

    #[test]
    fn receive_chained_dependency_expected_follow_up_request() {
        let source = ScriptedSource::default();
        let mut manager =
            DependencyManager::new().with_plugin(SampleStandardPlugin::new("identity", "s-1"));
        manager.fetch(&source);
        assert!(manager.receive(
            RequestId(1),
            Lookup::Ready(json!({ "standard_id": "std-1" })),
            &source
        ));

        assert_eq!(
            manager.pending_requests(),
            vec![(
                RequestId(2),
                DependencyKey::new(ReferenceKind::Standard, "std-1")
            )]
        );
        assert!(manager.receive(RequestId(2), Lookup::Ready(json!({ "d13c": 1.95 })), &source));
        assert!(manager.all_dependencies_are_loaded());
        assert!(manager.all_dependencies_are_valid());
    }

    #[test]
    fn receive_failed_lookup_expected_loaded_but_invalid() {
        let source = ScriptedSource::default();
        let mut manager =
            DependencyManager::new().with_plugin(ReferencePlugin::new("mass_spec", ms_key()));
        manager.fetch(&source);
        manager.receive(RequestId(1), Lookup::Failed("offline".to_string()), &source);

        assert!(manager.all_dependencies_are_loaded());
        assert!(!manager.all_dependencies_are_valid());
        assert_eq!(
            manager.errors(),
            vec![("mass_spec".to_string(), "offline".to_string())]
        );
    }

    #[test]
    fn dispose_expected_inert() {
        let source = ScriptedSource::default();
        let mut manager =
            DependencyManager::new().with_plugin(ReferencePlugin::new("mass_spec", ms_key()));
        manager.fetch(&source);
        manager.dispose();

        assert!(manager.is_disposed());
        assert!(manager.pending_requests().is_empty());
        assert!(!manager.receive(RequestId(1), Lookup::Ready(json!({})), &source));
        assert!(!manager.is_no_longer_valid(&DependencyChange::deleted(ms_key())));
    }
}
