use crate::{StepBinding, StepError, StepFamily, StepRuntime};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSpec {
    pub label: String,
    pub required: bool,
}

/// Labels a step type reads and writes, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepContract {
    pub family: StepFamily,
    pub inputs: Vec<LabelSpec>,
    pub outputs: Vec<LabelSpec>,
}

impl StepContract {
    pub fn replicate() -> Self {
        Self::new(StepFamily::Replicate)
    }

    pub fn sample() -> Self {
        Self::new(StepFamily::Sample)
    }

    pub fn new(family: StepFamily) -> Self {
        Self {
            family,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn required_input(mut self, label: impl Into<String>) -> Self {
        self.inputs.push(LabelSpec {
            label: label.into(),
            required: true,
        });
        self
    }

    pub fn optional_input(mut self, label: impl Into<String>) -> Self {
        self.inputs.push(LabelSpec {
            label: label.into(),
            required: false,
        });
        self
    }

    pub fn output(mut self, label: impl Into<String>) -> Self {
        self.outputs.push(LabelSpec {
            label: label.into(),
            required: false,
        });
        self
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|spec| spec.required)
            .map(|spec| spec.label.as_str())
    }
}

pub type StepFactory = Arc<dyn Fn(StepBinding) -> Result<StepRuntime, StepError> + Send + Sync>;

/// Metadata for one step type plus the factory that builds its runtime
/// calculator. Compilation only needs the metadata.
#[derive(Clone)]
pub struct StepController {
    tag: String,
    contract: StepContract,
    factory: StepFactory,
}

impl std::fmt::Debug for StepController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepController")
            .field("tag", &self.tag)
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

impl StepController {
    pub fn new<F>(tag: impl Into<String>, contract: StepContract, factory: F) -> Self
    where
        F: Fn(StepBinding) -> Result<StepRuntime, StepError> + Send + Sync + 'static,
    {
        Self {
            tag: tag.into(),
            contract,
            factory: Arc::new(factory),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn contract(&self) -> &StepContract {
        &self.contract
    }

    pub fn create_calculator(&self, binding: StepBinding) -> Result<StepRuntime, StepError> {
        (self.factory)(binding)
    }
}

pub type SharedStepController = Arc<StepController>;

#[derive(Clone, Debug, Default)]
pub struct StepRegistry {
    controllers: BTreeMap<String, SharedStepController>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, controller: StepController) -> Option<SharedStepController> {
        self.controllers
            .insert(controller.tag().to_string(), Arc::new(controller))
    }

    pub fn resolve(&self, step_type: &str) -> Option<SharedStepController> {
        self.controllers.get(step_type.trim()).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.controllers.contains_key(step_type.trim())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DependencyManager, Pad, ReplicateCalculator, StepCalculator, StepConfig};

    struct Noop(StepBinding);

    impl StepCalculator for Noop {
        fn binding(&self) -> &StepBinding {
            &self.0
        }

        fn calculate(
            &self,
            _records: &mut [Pad],
            _target: usize,
            _dependencies: Option<&DependencyManager>,
        ) -> Result<(), StepError> {
            Ok(())
        }
    }

    impl ReplicateCalculator for Noop {}

    fn noop_controller(tag: &str) -> StepController {
        StepController::new(
            tag,
            StepContract::replicate()
                .required_input("in")
                .optional_input("hint")
                .output("out"),
            |binding| Ok(StepRuntime::replicate(Noop(binding))),
        )
    }

    #[test]
    fn register_and_resolve_expected_same_controller() {
        let mut registry = StepRegistry::new();
        assert!(registry.register(noop_controller("noop")).is_none());
        assert!(registry.register(noop_controller("noop")).is_some());

        let resolved = registry.resolve(" noop ").expect("controller should resolve");
        assert_eq!(resolved.tag(), "noop");
        assert_eq!(
            resolved.contract().required_inputs().collect::<Vec<_>>(),
            vec!["in"]
        );
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn create_calculator_expected_binding_passed_through() {
        let controller = noop_controller("noop");
        let runtime = controller
            .create_calculator(StepBinding::new(&StepConfig::new(4, "noop"), None))
            .expect("calculator should build");
        assert_eq!(runtime.family(), StepFamily::Replicate);
        assert_eq!(runtime.binding().position, 4);
    }
}
