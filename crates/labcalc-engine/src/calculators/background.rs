use crate::calculators::registry::{StepContract, StepController};
use crate::{
    DependencyKey, DependencyManager, Pad, ReferenceKind, ReferencePlugin, ReplicateCalculator,
    StepBinding, StepCalculator, StepError, StepRuntime, target_pad, target_pad_mut,
};
use serde_json::Value;

pub const TAG: &str = "background";
pub const MASS_SPEC_PLUGIN: &str = "mass_spec";
const DEFAULT_MASS_SPEC_COLUMN: &str = "mass_spec_id";

pub fn controller() -> StepController {
    StepController::new(
        TAG,
        StepContract::replicate()
            .required_input("signal")
            .optional_input("mass_spec_id")
            .output("bg")
            .output("net"),
        |binding| Ok(StepRuntime::replicate(Background::new(binding)?)),
    )
}

/// Subtracts the mass spectrometer's background from a signal. The
/// background comes from the instrument's reference record.
#[derive(Debug)]
pub struct Background {
    binding: StepBinding,
    scale: f64,
}

impl Background {
    pub fn new(binding: StepBinding) -> Result<Self, StepError> {
        let scale = binding.try_param_f64("background_scale", 1.0)?;
        Ok(Self { binding, scale })
    }

    fn mass_spec_column(&self) -> &str {
        self.binding
            .label_to_column_name("mass_spec_id")
            .unwrap_or(DEFAULT_MASS_SPEC_COLUMN)
    }
}

impl StepCalculator for Background {
    fn binding(&self) -> &StepBinding {
        &self.binding
    }

    fn dependency_manager(&self, records: &[Pad], target: usize) -> Option<DependencyManager> {
        let mass_spec_id = target_pad(records, target)
            .ok()
            .and_then(|pad| pad.get_str(self.mass_spec_column()));
        let plugin = match mass_spec_id {
            Some(id) => ReferencePlugin::new(
                MASS_SPEC_PLUGIN,
                DependencyKey::new(ReferenceKind::MassSpec, id),
            ),
            None => ReferencePlugin::unavailable(
                MASS_SPEC_PLUGIN,
                "record does not name a mass spectrometer",
            ),
        };
        Some(DependencyManager::new().with_plugin(plugin))
    }

    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        let background = dependencies
            .and_then(|manager| manager.value(MASS_SPEC_PLUGIN))
            .and_then(|mass_spec| mass_spec.get("background"))
            .and_then(Value::as_f64)
            .ok_or_else(|| StepError::MissingDependency(MASS_SPEC_PLUGIN.to_string()))?;

        let pad = target_pad_mut(records, target)?;
        let signal = self.binding.require_double(pad, "signal")?;
        let bg = background * self.scale;
        self.binding.set_double(pad, "bg", bg);
        self.binding.set_double(pad, "net", signal - bg);
        Ok(())
    }
}

impl ReplicateCalculator for Background {}
