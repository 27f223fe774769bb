use crate::calculators::registry::{SharedStepController, StepRegistry};
use crate::{
    Analysis, CompilationFailed, CompileError, CompileErrorKind, StepConfig,
};
use std::collections::{BTreeMap, BTreeSet};

/// An analysis' steps resolved against a registry, with the columns the
/// pipeline needs from outside and the columns it generates.
#[derive(Clone, Debug)]
pub struct CompiledPipeline {
    analysis_id: String,
    steps: Vec<StepConfig>,
    controllers: Vec<Option<SharedStepController>>,
    required_input_columns: Vec<String>,
    generated_output_columns: Vec<String>,
    output_column_to_format: BTreeMap<String, String>,
    errors: Vec<CompileError>,
}

impl CompiledPipeline {
    pub fn from_analysis(analysis: &Analysis, registry: &StepRegistry) -> Self {
        Self::compile(&analysis.id, &analysis.steps, registry)
    }

    pub fn compile(analysis_id: &str, step_configs: &[StepConfig], registry: &StepRegistry) -> Self {
        let mut steps = step_configs.to_vec();
        steps.sort_by_key(|step| step.position);

        let mut errors = Vec::new();
        if steps.is_empty() {
            errors.push(CompileError::new(
                CompileErrorKind::EmptyPipeline,
                format!("analysis '{analysis_id}' has no steps"),
            ));
        }
        errors.extend(duplicate_positions(&steps));

        let controllers: Vec<Option<SharedStepController>> = steps
            .iter()
            .map(|step| {
                let controller = registry.resolve(&step.step_type);
                if controller.is_none() {
                    errors.push(
                        CompileError::new(
                            CompileErrorKind::UnknownStepType,
                            format!("no calculator registered for '{}'", step.step_type),
                        )
                        .with_position(step.position)
                        .with_step_type(step.step_type.clone()),
                    );
                }
                controller
            })
            .collect();

        let mut pipeline = Self {
            analysis_id: analysis_id.to_string(),
            steps,
            controllers,
            required_input_columns: Vec::new(),
            generated_output_columns: Vec::new(),
            output_column_to_format: BTreeMap::new(),
            errors,
        };
        pipeline.compute_columns();

        tracing::debug!(
            analysis = analysis_id,
            steps = pipeline.steps.len(),
            required = ?pipeline.required_input_columns,
            generated = ?pipeline.generated_output_columns,
            errors = pipeline.errors.len(),
            "compiled pipeline"
        );
        pipeline
    }

    fn compute_columns(&mut self) {
        let mut produced = BTreeSet::new();
        for (step, controller) in self.steps.iter().zip(&self.controllers) {
            if let Some(controller) = controller {
                for label in controller.contract().required_inputs() {
                    let Some(column) = step.inputs.get(label) else {
                        self.errors.push(
                            CompileError::new(
                                CompileErrorKind::UnboundRequiredInput,
                                format!("required input '{label}' is not bound to a column"),
                            )
                            .with_position(step.position)
                            .with_step_type(step.step_type.clone()),
                        );
                        continue;
                    };
                    if !produced.contains(column) && !self.required_input_columns.contains(column)
                    {
                        self.required_input_columns.push(column.clone());
                    }
                }
            }

            // Outputs of an unresolved step still count as produced.
            let labels: Vec<&str> = match controller {
                Some(controller) => controller
                    .contract()
                    .outputs
                    .iter()
                    .map(|spec| spec.label.as_str())
                    .filter(|label| step.outputs.contains_key(*label))
                    .collect(),
                None => step.outputs.keys().map(String::as_str).collect(),
            };
            for label in labels {
                let Some(column) = step.outputs.get(label) else {
                    continue;
                };
                if !self.generated_output_columns.contains(column) {
                    self.generated_output_columns.push(column.clone());
                    if let Some(format) = step.formats.get(label) {
                        self.output_column_to_format
                            .insert(column.clone(), format.clone());
                    }
                }
                produced.insert(column.clone());
            }
        }
    }

    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    /// Steps sorted by position.
    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn controller(&self, index: usize) -> Option<&SharedStepController> {
        self.controllers.get(index).and_then(Option::as_ref)
    }

    pub fn required_input_columns(&self) -> &[String] {
        &self.required_input_columns
    }

    pub fn generated_output_columns(&self) -> &[String] {
        &self.generated_output_columns
    }

    pub fn output_column_to_format(&self) -> &BTreeMap<String, String> {
        &self.output_column_to_format
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(CompileError::is_blocking)
    }

    pub fn ensure_runnable(&self) -> Result<(), CompilationFailed> {
        if self.has_blocking_errors() {
            return Err(CompilationFailed::new(
                self.analysis_id.clone(),
                self.errors.clone(),
            ));
        }
        Ok(())
    }
}

fn duplicate_positions(sorted: &[StepConfig]) -> Vec<CompileError> {
    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    let mut errors = Vec::new();
    for step in sorted {
        if !seen.insert(step.position) && reported.insert(step.position) {
            errors.push(
                CompileError::new(
                    CompileErrorKind::DuplicatePosition,
                    format!("more than one step uses position {}", step.position),
                )
                .with_position(step.position),
            );
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::core_registry;

    fn linear(position: u32, raw: &str, corrected: &str) -> StepConfig {
        StepConfig::new(position, "linear_correction")
            .input("raw", raw)
            .output("corrected", corrected)
    }

    #[test]
    fn compile_sorts_by_position() {
        let pipeline = CompiledPipeline::compile(
            "a",
            &[linear(1, "b", "c"), linear(0, "a", "b")],
            &core_registry(),
        );
        let positions: Vec<u32> = pipeline.steps().iter().map(|step| step.position).collect();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(pipeline.required_input_columns(), ["a".to_string()]);
        assert_eq!(
            pipeline.generated_output_columns(),
            ["b".to_string(), "c".to_string()]
        );
        assert!(!pipeline.has_errors());
    }

    #[test]
    fn compile_unknown_step_type_expected_non_blocking_error_and_outputs_kept() {
        let steps = vec![
            StepConfig::new(0, "mystery")
                .input("x", "raw")
                .output("y", "mystery_out"),
            linear(1, "mystery_out", "final"),
        ];
        let pipeline = CompiledPipeline::compile("a", &steps, &core_registry());

        assert_eq!(pipeline.errors().len(), 1);
        assert_eq!(pipeline.errors()[0].kind, CompileErrorKind::UnknownStepType);
        assert!(pipeline.controller(0).is_none());
        assert!(pipeline.controller(1).is_some());
        assert!(pipeline.required_input_columns().is_empty());
        assert_eq!(
            pipeline.generated_output_columns(),
            ["mystery_out".to_string(), "final".to_string()]
        );
        assert!(pipeline.ensure_runnable().is_ok());
    }

    #[test]
    fn compile_duplicate_positions_expected_blocking_error() {
        let pipeline = CompiledPipeline::compile(
            "a",
            &[linear(0, "a", "b"), linear(0, "b", "c"), linear(0, "c", "d")],
            &core_registry(),
        );
        let duplicates: Vec<_> = pipeline
            .errors()
            .iter()
            .filter(|error| error.kind == CompileErrorKind::DuplicatePosition)
            .collect();
        assert_eq!(duplicates.len(), 1);
        let failure = pipeline
            .ensure_runnable()
            .expect_err("duplicates should block");
        assert_eq!(failure.blocking_count, 1);
    }

    #[test]
    fn compile_empty_expected_blocking_error() {
        let pipeline = CompiledPipeline::compile("a", &[], &core_registry());
        assert_eq!(pipeline.errors()[0].kind, CompileErrorKind::EmptyPipeline);
        assert!(pipeline.has_blocking_errors());
    }

    #[test]
    fn compile_unbound_required_input_expected_error() {
        let steps = vec![StepConfig::new(0, "linear_correction").output("corrected", "out")];
        let pipeline = CompiledPipeline::compile("a", &steps, &core_registry());
        assert_eq!(
            pipeline.errors()[0].kind,
            CompileErrorKind::UnboundRequiredInput
        );
        assert_eq!(pipeline.generated_output_columns(), ["out".to_string()]);
    }

    #[test]
    fn compile_formats_follow_first_producer() {
        let steps = vec![
            linear(0, "a", "b").format("corrected", "0.000"),
            linear(1, "a", "b").format("corrected", "0.0"),
        ];
        let pipeline = CompiledPipeline::compile("a", &steps, &core_registry());
        assert_eq!(
            pipeline.output_column_to_format().get("b"),
            Some(&"0.000".to_string())
        );
        assert_eq!(pipeline.generated_output_columns(), ["b".to_string()]);
    }

    #[test]
    fn compile_optional_inputs_expected_not_required() {
        let steps = vec![
            StepConfig::new(0, "background")
                .input("signal", "v44")
                .input("mass_spec_id", "ms")
                .output("bg", "bg"),
        ];
        let pipeline = CompiledPipeline::compile("a", &steps, &core_registry());
        assert_eq!(pipeline.required_input_columns(), ["v44".to_string()]);
        assert_eq!(pipeline.generated_output_columns(), ["bg".to_string()]);
    }
}
