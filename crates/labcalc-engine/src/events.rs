use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub run_id: String,
    pub kind: ExecutionEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEventKind {
    RunStarted {
        analysis_id: String,
        scope: String,
        record_count: usize,
    },
    StepSkipped {
        position: u32,
        record_id: String,
        reason: String,
    },
    Suspended {
        position: u32,
        record_id: String,
        pending: usize,
    },
    Resumed {
        position: u32,
        record_id: String,
    },
    StepCompleted {
        position: u32,
        step_type: String,
        record_id: String,
    },
    StepFailed {
        position: Option<u32>,
        step_type: Option<String>,
        record_id: String,
        message: String,
    },
    RunFinished {
        error_count: usize,
        warning_count: usize,
    },
    RunInvalidated,
}

pub trait ExecutionEventObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

impl<F> ExecutionEventObserver for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) {
        self(event);
    }
}

pub type SharedExecutionEventObserver = Arc<dyn ExecutionEventObserver>;
pub type ExecutionEventSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type ExecutionEventReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

#[derive(Clone, Default)]
pub struct EventSink {
    observer: Option<SharedExecutionEventObserver>,
    sender: Option<ExecutionEventSender>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("observer", &self.observer.is_some())
            .field("sender", &self.sender.is_some())
            .finish()
    }
}

impl EventSink {
    pub fn with_observer(observer: SharedExecutionEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: ExecutionEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedExecutionEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: ExecutionEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn execution_event_channel() -> (ExecutionEventSender, ExecutionEventReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
