use crate::{
    CalculationError, CalculationWarning, EngineError, ExecutionState, Lookup, Pad, PadKind,
    ParameterizedPipeline, PipelineExecutor, RecordStatus, ReferenceFetcher, RunConfig,
};
use std::sync::Arc;

/// Drives an executor to `Finished`, answering every pending dependency
/// request through `fetcher`. Requests of one suspension are fetched in
/// order before any answer is fed back.
pub async fn drive_to_completion(
    executor: &mut PipelineExecutor,
    fetcher: &dyn ReferenceFetcher,
) -> Result<ExecutionState, EngineError> {
    let mut state = executor.execute()?;
    while state != ExecutionState::Finished {
        let pending = executor.pending_requests();
        if pending.is_empty() {
            return Err(EngineError::Dependency(format!(
                "run '{}' suspended in {} with no pending request",
                executor.run_id(),
                state.as_str()
            )));
        }

        let mut answers = Vec::with_capacity(pending.len());
        for (request_id, key) in pending {
            let lookup = match fetcher.fetch(&key).await {
                Ok(value) => Lookup::Ready(value),
                Err(message) => Lookup::Failed(message),
            };
            tracing::trace!(%key, request = request_id.0, "dependency fetched");
            answers.push((request_id, lookup));
        }
        for (request_id, lookup) in answers {
            state = executor.dependency_ready(request_id, lookup)?;
        }
    }
    Ok(state)
}

/// Everything the runs of [`calculate_sample`] produced. Errors and
/// warnings of replicate runs index into `sample.children()`.
#[derive(Debug)]
pub struct SampleCalculation {
    pub sample: Pad,
    pub run_ids: Vec<String>,
    pub errors: Vec<CalculationError>,
    pub warnings: Vec<CalculationWarning>,
}

impl SampleCalculation {
    fn absorb(&mut self, executor: &PipelineExecutor) {
        self.run_ids.push(executor.run_id().to_string());
        self.errors.extend_from_slice(executor.errors());
        self.warnings.extend_from_slice(executor.warnings());
    }
}

/// Calculates a sample from its raw replicates: a batch run over the
/// replicate children, a result run for every replicate that came out of
/// it without error, then the sample run over the updated children.
///
/// Replicate runs share the event sink and source of `config` and use
/// derived run ids; listeners only hear the sample run.
pub async fn calculate_sample(
    pipeline: Arc<ParameterizedPipeline>,
    mut sample: Pad,
    config: RunConfig,
    fetcher: &dyn ReferenceFetcher,
) -> Result<SampleCalculation, EngineError> {
    if sample.kind != PadKind::Sample {
        return Err(EngineError::InvalidRecords(format!(
            "record '{}' is a {} record, not a sample",
            sample.id,
            sample.kind.as_str()
        )));
    }

    let run_id = config
        .run_id
        .clone()
        .unwrap_or_else(|| format!("{}-sample-{}", pipeline.analysis_id(), sample.id));
    let replicate_config = |suffix: &str| RunConfig {
        run_id: Some(format!("{run_id}/{suffix}")),
        listeners: Vec::new(),
        ..config.clone()
    };
    let mut outcome = SampleCalculation {
        sample: Pad::sample(sample.id.clone()),
        run_ids: Vec::new(),
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let mut children = sample.take_children();
    if children.iter().any(|child| child.kind == PadKind::Replicate) {
        let mut batch = PipelineExecutor::batch(
            Arc::clone(&pipeline),
            children,
            replicate_config("replicates"),
        )?;
        drive_to_completion(&mut batch, fetcher).await?;
        outcome.absorb(&batch);
        children = batch.into_records();

        for index in 0..children.len() {
            let child = &children[index];
            let context_status = child.status();
            if child.kind != PadKind::Replicate || context_status == Some(RecordStatus::Error) {
                continue;
            }
            let config = replicate_config(&child.id);
            let mut single =
                PipelineExecutor::single_record(Arc::clone(&pipeline), children, index, config)?;
            drive_to_completion(&mut single, fetcher).await?;
            outcome.absorb(&single);
            children = single.into_records();

            let child = &mut children[index];
            if context_status == Some(RecordStatus::Warning)
                && child.status() == Some(RecordStatus::Ok)
            {
                child.set_status(RecordStatus::Warning);
            }
        }
    }
    sample.set_children(children);

    let mut aggregate = PipelineExecutor::sample(
        pipeline,
        sample,
        RunConfig {
            run_id: Some(run_id),
            ..config
        },
    )?;
    drive_to_completion(&mut aggregate, fetcher).await?;
    outcome.absorb(&aggregate);
    outcome.sample = aggregate.into_records().pop().ok_or_else(|| {
        EngineError::InvalidRecords("sample run returned no record".to_string())
    })?;
    Ok(outcome)
}
