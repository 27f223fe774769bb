//! Incremental, dependency-aware calculation engine for laboratory
//! analysis pipelines.
//!
//! An analysis is compiled against a step registry, bound to its
//! parameters and run by a resumable executor over a record set:
//! compile -> parameterize -> execute (suspending on reference data) ->
//! per-record status.

pub mod calculator;
pub mod calculators;
pub mod compiled;
pub mod config;
pub mod dependency;
pub mod diagnostics;
pub mod driver;
pub mod errors;
pub mod events;
pub mod executor;
pub mod pad;
pub mod parameterized;
pub mod runtime;
pub mod sources;

pub use calculator::*;
pub use calculators::registry::{
    LabelSpec, SharedStepController, StepContract, StepController, StepFactory, StepRegistry,
};
pub use calculators::{BuiltinStep, core_registry};
pub use compiled::*;
pub use config::*;
pub use dependency::*;
pub use diagnostics::*;
pub use driver::*;
pub use errors::*;
pub use events::{
    EventSink, ExecutionEvent, ExecutionEventKind, ExecutionEventObserver,
    ExecutionEventReceiver, ExecutionEventSender, SharedExecutionEventObserver,
    execution_event_channel,
};
pub use executor::*;
pub use pad::*;
pub use parameterized::*;
pub use runtime::*;
pub use sources::*;
