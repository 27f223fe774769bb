//! Resumable executor that drives a parameterized pipeline over a record
//! set.
//!
//! The executor is an explicit state machine. Its fields (state, the step
//! and record cursors, the current dependency manager and the collected
//! errors) are the whole continuation of a suspended run: `execute()`
//! returns as soon as a dependency fetch is pending, and the host resumes
//! it through [`PipelineExecutor::dependency_ready`] or another call to
//! [`PipelineExecutor::execute`].

use crate::events::timestamp_now;
use crate::{
    DependencyChange, DependencyKey, DependencyManager, EngineError, EventSink, ExecutionEvent,
    ExecutionEventKind, Lookup, Pad, ParameterizedPipeline, RecordStatus, RequestId, RunConfig,
    SharedReferenceSource, StepFamily, StepRuntime, HAS_ERRORS_KEY,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    ValidateNumbers,
    FetchDependency,
    Execute,
    IncrementNumbers,
    Terminating,
    Finished,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidateNumbers => "validate_numbers",
            Self::FetchDependency => "fetch_dependency",
            Self::Execute => "execute",
            Self::IncrementNumbers => "increment_numbers",
            Self::Terminating => "terminating",
            Self::Finished => "finished",
        }
    }
}

/// Which records a run covers and which steps apply to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunScope {
    /// Every replicate record, step-major: step 0 runs over every record
    /// before step 1 starts. Only context steps run.
    Batch,
    /// One replicate record of the set. Only result steps run.
    SingleRecord { target: usize },
    /// One sample record whose replicates already finished. Only sample
    /// steps run.
    Sample,
}

impl RunScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::SingleRecord { .. } => "single_record",
            Self::Sample => "sample",
        }
    }

    /// The step family this scope runs. Records of any other kind are
    /// carried along untouched.
    pub fn family(self) -> StepFamily {
        match self {
            Self::Batch | Self::SingleRecord { .. } => StepFamily::Replicate,
            Self::Sample => StepFamily::Sample,
        }
    }

    fn applies(self, calculator: &StepRuntime) -> bool {
        if calculator.family() != self.family() {
            return false;
        }
        match self {
            Self::Batch => calculator.applies_to_context(),
            Self::SingleRecord { .. } => calculator.applies_to_results(),
            Self::Sample => true,
        }
    }
}

/// A recorded failure of one record, attributed to the step that raised
/// it when there is one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalculationError {
    pub record_index: usize,
    pub record_id: String,
    pub step_position: Option<u32>,
    pub step_type: Option<String>,
    pub message: String,
}

impl std::fmt::Display for CalculationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.step_position, &self.step_type) {
            (Some(position), Some(step_type)) => write!(
                f,
                "record '{}' step {} ({}): {}",
                self.record_id, position, step_type, self.message
            ),
            _ => write!(f, "record '{}': {}", self.record_id, self.message),
        }
    }
}

/// A non-fatal notice reported by a dependency plugin next to an
/// otherwise successful calculation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalculationWarning {
    pub record_index: usize,
    pub record_id: String,
    pub step_position: u32,
    pub message: String,
}

pub trait ExecutorListener: Send + Sync {
    fn status_changed(&self, executor: &PipelineExecutor);
}

impl<F> ExecutorListener for F
where
    F: Fn(&PipelineExecutor) + Send + Sync,
{
    fn status_changed(&self, executor: &PipelineExecutor) {
        self(executor);
    }
}

pub type SharedExecutorListener = Arc<dyn ExecutorListener>;

pub struct PipelineExecutor {
    pipeline: Arc<ParameterizedPipeline>,
    scope: RunScope,
    run_id: String,
    records: Vec<Pad>,
    state: ExecutionState,
    step_cursor: usize,
    record_cursor: usize,
    dependencies: Option<DependencyManager>,
    finished_dependencies: Vec<DependencyManager>,
    errors: Vec<CalculationError>,
    warnings: Vec<CalculationWarning>,
    listeners: Vec<SharedExecutorListener>,
    events: EventSink,
    source: SharedReferenceSource,
    catch_panics: bool,
    sequence_no: u64,
    calculation_count: usize,
    started: bool,
    suspended: bool,
    no_longer_valid: bool,
    disposed: bool,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("run_id", &self.run_id)
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("step_cursor", &self.step_cursor)
            .field("record_cursor", &self.record_cursor)
            .field("errors", &self.errors.len())
            .field("no_longer_valid", &self.no_longer_valid)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Runs every context step over every record, step-major.
    pub fn batch(
        pipeline: Arc<ParameterizedPipeline>,
        records: Vec<Pad>,
        config: RunConfig,
    ) -> Result<Self, EngineError> {
        Self::new(pipeline, records, RunScope::Batch, config)
    }

    /// Runs every result step over `records[target]`; the other records
    /// stay readable by steps that need the whole set.
    pub fn single_record(
        pipeline: Arc<ParameterizedPipeline>,
        records: Vec<Pad>,
        target: usize,
        config: RunConfig,
    ) -> Result<Self, EngineError> {
        Self::new(pipeline, records, RunScope::SingleRecord { target }, config)
    }

    /// Runs every sample step over `sample` once all of its replicates
    /// resolved without error.
    pub fn sample(
        pipeline: Arc<ParameterizedPipeline>,
        sample: Pad,
        config: RunConfig,
    ) -> Result<Self, EngineError> {
        Self::new(pipeline, vec![sample], RunScope::Sample, config)
    }

    pub fn new(
        pipeline: Arc<ParameterizedPipeline>,
        records: Vec<Pad>,
        scope: RunScope,
        config: RunConfig,
    ) -> Result<Self, EngineError> {
        pipeline
            .ensure_runnable()
            .map_err(|failure| EngineError::InvalidPipeline(failure.to_string()))?;
        match scope {
            RunScope::Batch => {}
            RunScope::SingleRecord { target } => {
                let Some(record) = records.get(target) else {
                    return Err(EngineError::InvalidRecords(format!(
                        "target record {} is out of range for {} record(s)",
                        target,
                        records.len()
                    )));
                };
                if record.kind != scope.family().record_kind() {
                    return Err(EngineError::InvalidRecords(format!(
                        "target record '{}' is a {} record, not a {}",
                        record.id,
                        record.kind.as_str(),
                        scope.family().record_kind().as_str()
                    )));
                }
            }
            RunScope::Sample => {
                if records.len() != 1 || records[0].kind != scope.family().record_kind() {
                    return Err(EngineError::InvalidRecords(
                        "a sample run needs exactly one sample record".to_string(),
                    ));
                }
            }
        }

        let run_id = config
            .run_id
            .unwrap_or_else(|| format!("{}-{}", pipeline.analysis_id(), scope.as_str()));
        let mut executor = Self {
            pipeline,
            scope,
            run_id,
            records,
            state: ExecutionState::ValidateNumbers,
            step_cursor: 0,
            record_cursor: 0,
            dependencies: None,
            finished_dependencies: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            listeners: config.listeners,
            events: config.events,
            source: config.source,
            catch_panics: config.catch_panics,
            sequence_no: 0,
            calculation_count: 0,
            started: false,
            suspended: false,
            no_longer_valid: false,
            disposed: false,
        };
        executor.record_cursor = executor.record_start();
        executor.prepare_records();
        Ok(executor)
    }

    fn record_start(&self) -> usize {
        match self.scope {
            RunScope::Batch | RunScope::Sample => 0,
            RunScope::SingleRecord { target } => target,
        }
    }

    fn record_end(&self) -> usize {
        match self.scope {
            RunScope::Batch => self.records.len(),
            RunScope::SingleRecord { target } => target + 1,
            RunScope::Sample => 1,
        }
    }

    /// Whether the run calculates `records[index]`. Records outside the
    /// cursor range or of another kind keep their status.
    fn targets(&self, index: usize) -> bool {
        (self.record_start()..self.record_end()).contains(&index)
            && self.records[index].kind == self.scope.family().record_kind()
    }

    fn prepare_records(&mut self) {
        for index in self.record_start()..self.record_end() {
            if self.targets(index) {
                self.records[index].clear_volatile(HAS_ERRORS_KEY);
            }
        }

        match self.scope {
            RunScope::Batch | RunScope::SingleRecord { .. } => {
                let required = self.pipeline.required_input_columns().to_vec();
                for index in self.record_start()..self.record_end() {
                    if !self.targets(index) {
                        continue;
                    }
                    let missing = self.records[index].missing_columns(&required);
                    if !missing.is_empty() {
                        self.record_error(
                            index,
                            None,
                            format!("missing required input column(s): {}", missing.join(", ")),
                        );
                    }
                }
                if let RunScope::SingleRecord { target } = self.scope {
                    if self.records[target].has_errors() {
                        self.state = ExecutionState::Terminating;
                    }
                }
            }
            RunScope::Sample => {
                let sample = &self.records[0];
                let unresolved: Vec<String> = sample
                    .children()
                    .iter()
                    .filter(|child| {
                        child.kind == StepFamily::Replicate.record_kind()
                            && matches!(child.status(), None | Some(RecordStatus::Error))
                    })
                    .map(|child| child.id.clone())
                    .collect();
                let replicate_count = sample
                    .children()
                    .iter()
                    .filter(|child| child.kind == StepFamily::Replicate.record_kind())
                    .count();
                let message = if replicate_count == 0 {
                    Some("sample has no replicates".to_string())
                } else if !unresolved.is_empty() {
                    Some(format!(
                        "replicate(s) {} are unresolved or in error",
                        unresolved.join(", ")
                    ))
                } else {
                    None
                };
                if let Some(message) = message {
                    self.record_error(0, None, message);
                    self.state = ExecutionState::Terminating;
                }
            }
        }
    }

    /// Runs until the executor finishes or a dependency fetch is pending.
    /// Calling it on a finished executor is a no-op.
    pub fn execute(&mut self) -> Result<ExecutionState, EngineError> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        if !self.started {
            self.started = true;
            tracing::debug!(
                run_id = %self.run_id,
                scope = self.scope.as_str(),
                records = self.records.len(),
                "pipeline run started"
            );
            self.emit(ExecutionEventKind::RunStarted {
                analysis_id: self.pipeline.analysis_id().to_string(),
                scope: self.scope.as_str().to_string(),
                record_count: self.records.len(),
            });
        } else if self.suspended {
            self.suspended = false;
            tracing::debug!(
                run_id = %self.run_id,
                step = self.step_cursor,
                record = self.record_cursor,
                "pipeline run resumed"
            );
            self.emit(ExecutionEventKind::Resumed {
                position: self.current_position().unwrap_or_default(),
                record_id: self.current_record_id(),
            });
        }

        loop {
            tracing::trace!(state = self.state.as_str(), "executor state");
            match self.state {
                ExecutionState::ValidateNumbers => self.validate_numbers(),
                ExecutionState::FetchDependency => {
                    if !self.fetch_dependency() {
                        self.suspend();
                        return Ok(self.state);
                    }
                }
                ExecutionState::Execute => self.execute_step(),
                ExecutionState::IncrementNumbers => self.increment_numbers(),
                ExecutionState::Terminating => self.terminate(),
                ExecutionState::Finished => return Ok(self.state),
            }
        }
    }

    /// Same entry point as `execute`; reads better at a resumption site.
    pub fn resume(&mut self) -> Result<ExecutionState, EngineError> {
        self.execute()
    }

    /// Feeds the answer of a pending request back and resumes the run when
    /// the executor was waiting for it. Unknown request ids are ignored.
    pub fn dependency_ready(
        &mut self,
        request_id: RequestId,
        lookup: Lookup,
    ) -> Result<ExecutionState, EngineError> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        let source = Arc::clone(&self.source);
        let accepted = self
            .dependencies
            .as_mut()
            .is_some_and(|manager| manager.receive(request_id, lookup, source.as_ref()));
        if !accepted {
            tracing::debug!(
                run_id = %self.run_id,
                request = request_id.0,
                "ignoring response for unknown request"
            );
            return Ok(self.state);
        }
        if self.state == ExecutionState::FetchDependency {
            return self.execute();
        }
        Ok(self.state)
    }

    pub fn pending_requests(&self) -> Vec<(RequestId, DependencyKey)> {
        self.dependencies
            .as_ref()
            .map(DependencyManager::pending_requests)
            .unwrap_or_default()
    }

    /// Forwards an external change notification to every dependency the
    /// run used. Returns whether the change made this run stale.
    pub fn notify_change(&mut self, change: &DependencyChange) -> bool {
        if self.disposed {
            return false;
        }
        let affected = self
            .finished_dependencies
            .iter()
            .chain(self.dependencies.iter())
            .any(|manager| manager.is_no_longer_valid(change));
        if affected {
            self.dependencies_no_longer_valid();
        }
        affected
    }

    /// Marks the run stale. The flag never resets; listeners hear about it
    /// at most once, and only after the run finished.
    pub fn dependencies_no_longer_valid(&mut self) {
        if self.disposed || self.no_longer_valid {
            return;
        }
        self.no_longer_valid = true;
        tracing::info!(run_id = %self.run_id, "pipeline results no longer valid");
        self.emit(ExecutionEventKind::RunInvalidated);
        if self.state == ExecutionState::Finished {
            self.notify_listeners();
        }
    }

    pub fn add_listener(&mut self, listener: SharedExecutorListener) {
        if !self.disposed {
            self.listeners.push(listener);
        }
    }

    /// Releases every dependency manager and listener. The executor stays
    /// inert afterwards.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut manager) = self.dependencies.take() {
            manager.dispose();
        }
        for manager in &mut self.finished_dependencies {
            manager.dispose();
        }
        self.finished_dependencies.clear();
        self.listeners.clear();
        tracing::debug!(run_id = %self.run_id, "executor disposed");
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn scope(&self) -> RunScope {
        self.scope
    }

    pub fn pipeline(&self) -> &ParameterizedPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExecutionState::Finished
    }

    pub fn is_no_longer_valid(&self) -> bool {
        self.no_longer_valid
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Current `(step index, record index)`.
    pub fn cursor(&self) -> (usize, usize) {
        (self.step_cursor, self.record_cursor)
    }

    pub fn errors(&self) -> &[CalculationError] {
        &self.errors
    }

    pub fn warnings(&self) -> &[CalculationWarning] {
        &self.warnings
    }

    pub fn records(&self) -> &[Pad] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Pad> {
        self.records
    }

    /// Number of `calculate()` calls made so far.
    pub fn calculation_count(&self) -> usize {
        self.calculation_count
    }

    fn validate_numbers(&mut self) {
        if self.step_cursor >= self.pipeline.step_count() || self.record_cursor >= self.record_end()
        {
            self.state = ExecutionState::Terminating;
            return;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let skip_reason = match pipeline.calculator(self.step_cursor) {
            None => Some("step has no calculator"),
            Some(calculator) => {
                let record = &self.records[self.record_cursor];
                if record.has_errors() {
                    Some("record has errors")
                } else if record.kind != calculator.family().record_kind() {
                    Some("record kind does not match step family")
                } else if !self.scope.applies(calculator) {
                    Some("step does not apply to this run")
                } else {
                    None
                }
            }
        };

        match skip_reason {
            Some(reason) => {
                if let Some(position) = self.current_position() {
                    self.emit(ExecutionEventKind::StepSkipped {
                        position,
                        record_id: self.current_record_id(),
                        reason: reason.to_string(),
                    });
                }
                self.state = ExecutionState::IncrementNumbers;
            }
            None => self.state = ExecutionState::FetchDependency,
        }
    }

    /// Returns `false` when the run has to suspend.
    fn fetch_dependency(&mut self) -> bool {
        if self.dependencies.is_none() {
            let pipeline = Arc::clone(&self.pipeline);
            let Some(calculator) = pipeline.calculator(self.step_cursor) else {
                self.state = ExecutionState::IncrementNumbers;
                return true;
            };
            match calculator.dependency_manager(&self.records, self.record_cursor) {
                Some(mut manager) if !manager.is_empty() => {
                    manager.fetch(self.source.as_ref());
                    self.dependencies = Some(manager);
                }
                _ => {
                    self.state = ExecutionState::Execute;
                    return true;
                }
            }
        }

        let loaded = self
            .dependencies
            .as_ref()
            .is_some_and(DependencyManager::all_dependencies_are_loaded);
        if loaded {
            self.state = ExecutionState::Execute;
        }
        loaded
    }

    fn suspend(&mut self) {
        self.suspended = true;
        let pending = self.pending_requests().len();
        tracing::debug!(
            run_id = %self.run_id,
            step = self.step_cursor,
            record = self.record_cursor,
            pending,
            "pipeline run suspended on dependencies"
        );
        self.emit(ExecutionEventKind::Suspended {
            position: self.current_position().unwrap_or_default(),
            record_id: self.current_record_id(),
            pending,
        });
    }

    fn execute_step(&mut self) {
        self.state = ExecutionState::IncrementNumbers;
        let pipeline = Arc::clone(&self.pipeline);
        let Some(calculator) = pipeline.calculator(self.step_cursor) else {
            return;
        };
        let target = self.record_cursor;
        let manager = self.dependencies.take();

        let valid = manager
            .as_ref()
            .is_none_or(DependencyManager::all_dependencies_are_valid);
        if let Some(manager) = manager.as_ref() {
            if valid {
                for message in manager.warnings() {
                    self.warnings.push(CalculationWarning {
                        record_index: target,
                        record_id: self.records[target].id.clone(),
                        step_position: calculator.binding().position,
                        message,
                    });
                }
            } else {
                for (plugin, message) in manager.errors() {
                    self.record_error(target, Some(calculator), format!("{plugin}: {message}"));
                }
            }
        }

        if valid {
            self.calculation_count += 1;
            let outcome = run_calculator(
                calculator,
                &mut self.records,
                target,
                manager.as_ref(),
                self.catch_panics,
            );
            match outcome {
                Ok(()) => self.emit(ExecutionEventKind::StepCompleted {
                    position: calculator.binding().position,
                    step_type: calculator.binding().step_type.clone(),
                    record_id: self.records[target].id.clone(),
                }),
                Err(message) => self.record_error(target, Some(calculator), message),
            }
        }

        // Kept so later change notifications can mark the run stale.
        if let Some(manager) = manager {
            self.finished_dependencies.push(manager);
        }
    }

    fn increment_numbers(&mut self) {
        self.record_cursor += 1;
        if self.record_cursor >= self.record_end() {
            self.record_cursor = self.record_start();
            self.step_cursor += 1;
        }
        self.state = ExecutionState::ValidateNumbers;
    }

    fn terminate(&mut self) {
        let failed: BTreeSet<usize> = self.errors.iter().map(|error| error.record_index).collect();
        let warned: BTreeSet<usize> = self
            .warnings
            .iter()
            .map(|warning| warning.record_index)
            .collect();
        for index in self.record_start()..self.record_end() {
            if !self.targets(index) {
                continue;
            }
            let record = &mut self.records[index];
            let status = if failed.contains(&index) || record.has_errors() {
                RecordStatus::Error
            } else if warned.contains(&index) {
                RecordStatus::Warning
            } else {
                RecordStatus::Ok
            };
            record.set_status(status);
        }

        self.state = ExecutionState::Finished;
        tracing::info!(
            run_id = %self.run_id,
            errors = self.errors.len(),
            warnings = self.warnings.len(),
            calculations = self.calculation_count,
            "pipeline run finished"
        );
        self.emit(ExecutionEventKind::RunFinished {
            error_count: self.errors.len(),
            warning_count: self.warnings.len(),
        });
        self.notify_listeners();
    }

    fn record_error(&mut self, index: usize, step: Option<&StepRuntime>, message: String) {
        let record = &mut self.records[index];
        record.set_volatile(HAS_ERRORS_KEY, Value::Bool(true));
        let error = CalculationError {
            record_index: index,
            record_id: record.id.clone(),
            step_position: step.map(|step| step.binding().position),
            step_type: step.map(|step| step.binding().step_type.clone()),
            message,
        };
        tracing::warn!(run_id = %self.run_id, "{error}");
        self.emit(ExecutionEventKind::StepFailed {
            position: error.step_position,
            step_type: error.step_type.clone(),
            record_id: error.record_id.clone(),
            message: error.message.clone(),
        });
        self.errors.push(error);
    }

    fn notify_listeners(&self) {
        for listener in &self.listeners {
            listener.status_changed(self);
        }
    }

    fn current_position(&self) -> Option<u32> {
        self.pipeline
            .compiled()
            .steps()
            .get(self.step_cursor)
            .map(|step| step.position)
    }

    fn current_record_id(&self) -> String {
        self.records
            .get(self.record_cursor)
            .map(|record| record.id.clone())
            .unwrap_or_default()
    }

    fn emit(&mut self, kind: ExecutionEventKind) {
        if !self.events.is_enabled() {
            return;
        }
        let event = ExecutionEvent {
            sequence_no: self.sequence_no,
            timestamp: timestamp_now(),
            run_id: self.run_id.clone(),
            kind,
        };
        self.sequence_no += 1;
        self.events.emit(event);
    }
}

fn run_calculator(
    calculator: &StepRuntime,
    records: &mut [Pad],
    target: usize,
    dependencies: Option<&DependencyManager>,
    catch_panics: bool,
) -> Result<(), String> {
    let step_type = &calculator.binding().step_type;
    let result = if catch_panics {
        panic::catch_unwind(AssertUnwindSafe(|| {
            calculator.calculate(records, target, dependencies)
        }))
        .map_err(|payload| panic_message(payload.as_ref()))
    } else {
        Ok(calculator.calculate(records, target, dependencies))
    };
    let message = match result {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => Some(error.to_string()),
        Err(message) => message,
    };
    Err(message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| step_type.clone()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}
