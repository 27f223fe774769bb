use crate::calculators::registry::{StepContract, StepController};
use crate::{
    DependencyKey, DependencyManager, Pad, ReferenceKind, ReferencePlugin, ReplicateCalculator,
    StepBinding, StepCalculator, StepError, StepRuntime, target_pad, target_pad_mut,
};
use serde_json::Value;

pub const TAG: &str = "acid_fractionation";
pub const ACID_PLUGIN: &str = "acid_temperature";
const DEFAULT_ACID_COLUMN: &str = "acid_id";
const KELVIN_OFFSET: f64 = 273.15;

pub fn controller() -> StepController {
    StepController::new(
        TAG,
        StepContract::replicate()
            .required_input("value")
            .optional_input("acid_id")
            .output("corrected")
            .output("fractionation"),
        |binding| Ok(StepRuntime::replicate(AcidFractionation::new(binding)?)),
    )
}

/// Removes the temperature-dependent acid digestion fractionation
/// `coefficient * 1000 / T[K] + constant` from a value. The digestion
/// temperature is reference data of the acid bath.
#[derive(Debug)]
pub struct AcidFractionation {
    binding: StepBinding,
    coefficient: f64,
    constant: f64,
}

impl AcidFractionation {
    pub fn new(binding: StepBinding) -> Result<Self, StepError> {
        let coefficient = binding.try_param_f64("coefficient", 3.48)?;
        let constant = binding.try_param_f64("constant", -1.47)?;
        Ok(Self {
            binding,
            coefficient,
            constant,
        })
    }

    pub fn fractionation(&self, temperature_celsius: f64) -> Result<f64, StepError> {
        let kelvin = temperature_celsius + KELVIN_OFFSET;
        if kelvin <= 0.0 {
            return Err(StepError::calculation(format!(
                "acid temperature {temperature_celsius} C is below absolute zero"
            )));
        }
        Ok(self.coefficient * 1000.0 / kelvin + self.constant)
    }
}

impl StepCalculator for AcidFractionation {
    fn binding(&self) -> &StepBinding {
        &self.binding
    }

    fn dependency_manager(&self, records: &[Pad], target: usize) -> Option<DependencyManager> {
        let column = self
            .binding
            .label_to_column_name("acid_id")
            .unwrap_or(DEFAULT_ACID_COLUMN);
        let plugin = match target_pad(records, target)
            .ok()
            .and_then(|pad| pad.get_str(column))
        {
            Some(id) => ReferencePlugin::new(
                ACID_PLUGIN,
                DependencyKey::new(ReferenceKind::AcidTemperature, id),
            ),
            None => ReferencePlugin::unavailable(ACID_PLUGIN, "record does not name an acid bath"),
        };
        Some(DependencyManager::new().with_plugin(plugin))
    }

    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        let temperature = dependencies
            .and_then(|manager| manager.value(ACID_PLUGIN))
            .and_then(|acid| acid.get("temperature"))
            .and_then(Value::as_f64)
            .ok_or_else(|| StepError::MissingDependency(ACID_PLUGIN.to_string()))?;
        let fractionation = self.fractionation(temperature)?;

        let pad = target_pad_mut(records, target)?;
        let value = self.binding.require_double(pad, "value")?;
        self.binding.set_double(pad, "fractionation", fractionation);
        self.binding
            .set_double(pad, "corrected", value - fractionation);
        Ok(())
    }
}

impl ReplicateCalculator for AcidFractionation {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lookup, ReferenceSource, StepConfig};
    use serde_json::json;

    struct Baths;

    impl ReferenceSource for Baths {
        fn lookup(&self, _key: &DependencyKey) -> Lookup {
            Lookup::Ready(json!({ "temperature": 76.85 }))
        }
    }

    fn calculator() -> AcidFractionation {
        let step = StepConfig::new(2, TAG)
            .input("value", "d18o")
            .output("corrected", "d18o_acid")
            .output("fractionation", "acid_frac");
        AcidFractionation::new(StepBinding::new(&step, None)).expect("calculator should build")
    }

    #[test]
    fn fractionation_at_350_kelvin_expected_default_coefficients() {
        let calculator = calculator();
        let value = calculator
            .fractionation(76.85)
            .expect("temperature is valid");
        assert!((value - (3.48 * 1000.0 / 350.0 - 1.47)).abs() < 1e-9);
    }

    #[test]
    fn fractionation_below_absolute_zero_expected_error() {
        assert!(calculator().fractionation(-300.0).is_err());
    }

    #[test]
    fn calculate_with_acid_bath_expected_corrected_value() {
        let calculator = calculator();
        let mut records = vec![
            Pad::replicate("r1")
                .with_number("d18o", 30.0)
                .with_text("acid_id", "bath-1"),
        ];
        let mut manager = calculator
            .dependency_manager(&records, 0)
            .expect("acid step needs a bath");
        manager.fetch(&Baths);

        calculator
            .calculate(&mut records, 0, Some(&manager))
            .expect("calculate should succeed");
        let expected_fractionation = 3.48 * 1000.0 / 350.0 - 1.47;
        let corrected = records[0].get_f64("d18o_acid").expect("corrected written");
        assert!((corrected - (30.0 - expected_fractionation)).abs() < 1e-9);
        assert!(records[0].get_f64("acid_frac").is_some());
    }
}
