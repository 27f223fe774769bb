use crate::calculators::registry::StepRegistry;
use crate::{
    Analysis, CompilationFailed, CompileError, CompileErrorKind, CompiledPipeline, StepBinding,
    StepParams, StepRuntime,
};
use std::collections::BTreeMap;

/// A compiled pipeline with parameters bound by step index and one
/// runnable calculator per resolvable step.
///
/// `StepParams::position` names the index of the step in the sorted
/// pipeline, so params keep binding when step positions have gaps.
#[derive(Debug)]
pub struct ParameterizedPipeline {
    compiled: CompiledPipeline,
    fingerprint: Option<String>,
    params: Vec<Option<StepParams>>,
    calculators: Vec<Option<StepRuntime>>,
    errors: Vec<CompileError>,
}

impl ParameterizedPipeline {
    pub fn from_analysis(analysis: &Analysis, registry: &StepRegistry) -> Self {
        let compiled = CompiledPipeline::from_analysis(analysis, registry);
        let mut pipeline = Self::new(compiled, &analysis.params);
        pipeline.fingerprint = analysis.fingerprint().ok();
        pipeline
    }

    pub fn new(compiled: CompiledPipeline, step_params: &[StepParams]) -> Self {
        let mut errors = compiled.errors().to_vec();

        let mut by_position: BTreeMap<u32, StepParams> = BTreeMap::new();
        for params in step_params {
            if by_position.contains_key(&params.position) {
                errors.push(
                    CompileError::new(
                        CompileErrorKind::DuplicateParams,
                        format!("more than one parameter set uses position {}", params.position),
                    )
                    .with_position(params.position),
                );
                continue;
            }
            by_position.insert(params.position, params.clone());
        }

        let mut params = Vec::with_capacity(compiled.step_count());
        let mut calculators = Vec::with_capacity(compiled.step_count());
        for (index, step) in compiled.steps().iter().enumerate() {
            let bound = u32::try_from(index)
                .ok()
                .and_then(|index| by_position.remove(&index));
            let calculator = compiled.controller(index).and_then(|controller| {
                let binding = StepBinding::new(step, bound.clone());
                match controller.create_calculator(binding) {
                    Ok(runtime) if runtime.family() == controller.contract().family => {
                        Some(runtime)
                    }
                    Ok(runtime) => {
                        errors.push(
                            CompileError::new(
                                CompileErrorKind::CalculatorConstruction,
                                format!(
                                    "factory built a {} calculator for a {} step",
                                    runtime.family().as_str(),
                                    controller.contract().family.as_str()
                                ),
                            )
                            .with_position(step.position)
                            .with_step_type(step.step_type.clone()),
                        );
                        None
                    }
                    Err(error) => {
                        errors.push(
                            CompileError::new(
                                CompileErrorKind::CalculatorConstruction,
                                error.to_string(),
                            )
                            .with_position(step.position)
                            .with_step_type(step.step_type.clone()),
                        );
                        None
                    }
                }
            });
            params.push(bound);
            calculators.push(calculator);
        }

        for orphan in by_position.keys() {
            tracing::warn!(
                analysis = compiled.analysis_id(),
                index = orphan,
                "parameters bound to an index with no step"
            );
        }

        Self {
            compiled,
            fingerprint: None,
            params,
            calculators,
            errors,
        }
    }

    pub fn compiled(&self) -> &CompiledPipeline {
        &self.compiled
    }

    pub fn analysis_id(&self) -> &str {
        self.compiled.analysis_id()
    }

    /// Content hash of the analysis this pipeline was built from, when it
    /// was built from one. Callers compare it to decide whether to rebuild.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.calculators.len()
    }

    pub fn calculator(&self, index: usize) -> Option<&StepRuntime> {
        self.calculators.get(index).and_then(Option::as_ref)
    }

    pub fn params(&self, index: usize) -> Option<&StepParams> {
        self.params.get(index).and_then(Option::as_ref)
    }

    pub fn required_input_columns(&self) -> &[String] {
        self.compiled.required_input_columns()
    }

    pub fn generated_output_columns(&self) -> &[String] {
        self.compiled.generated_output_columns()
    }

    /// Compile errors plus parameter binding and construction errors.
    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(CompileError::is_blocking)
    }

    pub fn ensure_runnable(&self) -> Result<(), CompilationFailed> {
        if self.has_blocking_errors() {
            return Err(CompilationFailed::new(
                self.compiled.analysis_id(),
                self.errors.clone(),
            ));
        }
        Ok(())
    }
}
