use crate::{EventSink, NoReferenceSource, SharedExecutorListener, SharedReferenceSource};
use std::sync::Arc;

/// Per-run settings handed to a `PipelineExecutor` constructor.
#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub events: EventSink,
    pub source: SharedReferenceSource,
    pub listeners: Vec<SharedExecutorListener>,
    /// Convert panics inside a step's `calculate()` into calculation
    /// errors instead of unwinding through the executor.
    pub catch_panics: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            events: EventSink::default(),
            source: Arc::new(NoReferenceSource),
            listeners: Vec::new(),
            catch_panics: true,
        }
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("run_id", &self.run_id)
            .field("events", &self.events)
            .field("listeners", &self.listeners.len())
            .field("catch_panics", &self.catch_panics)
            .finish_non_exhaustive()
    }
}
