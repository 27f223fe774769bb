use crate::calculators::registry::{StepContract, StepController};
use crate::{
    DependencyManager, Pad, ReplicateCalculator, StepBinding, StepCalculator, StepError,
    StepRuntime, target_pad_mut,
};

pub const TAG: &str = "linear_correction";

pub fn controller() -> StepController {
    StepController::new(
        TAG,
        StepContract::replicate()
            .required_input("raw")
            .output("corrected"),
        |binding| Ok(StepRuntime::replicate(LinearCorrection::new(binding)?)),
    )
}

/// `corrected = slope * raw + intercept`.
#[derive(Debug)]
pub struct LinearCorrection {
    binding: StepBinding,
    slope: f64,
    intercept: f64,
}

impl LinearCorrection {
    pub fn new(binding: StepBinding) -> Result<Self, StepError> {
        let slope = binding.try_param_f64("slope", 1.0)?;
        let intercept = binding.try_param_f64("intercept", 0.0)?;
        Ok(Self {
            binding,
            slope,
            intercept,
        })
    }
}

impl StepCalculator for LinearCorrection {
    fn binding(&self) -> &StepBinding {
        &self.binding
    }

    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        _dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        let pad = target_pad_mut(records, target)?;
        let raw = self.binding.require_double(pad, "raw")?;
        self.binding
            .set_double(pad, "corrected", self.slope * raw + self.intercept);
        Ok(())
    }
}

impl ReplicateCalculator for LinearCorrection {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StepConfig, StepParams};
    use serde_json::json;

    fn binding(params: Option<StepParams>) -> StepBinding {
        let step = StepConfig::new(0, TAG)
            .input("raw", "d45")
            .output("corrected", "d45_corr");
        StepBinding::new(&step, params)
    }

    #[test]
    fn calculate_with_params_expected_linear_output() {
        let calculator = LinearCorrection::new(binding(Some(
            StepParams::new(0)
                .with("slope", json!(2.0))
                .with("intercept", json!(-1.0)),
        )))
        .expect("calculator should build");
        let mut records = vec![Pad::replicate("r1").with_number("d45", 3.0)];

        calculator
            .calculate(&mut records, 0, None)
            .expect("calculate should succeed");
        assert_eq!(records[0].get_f64("d45_corr"), Some(5.0));
    }

    #[test]
    fn calculate_without_params_expected_identity() {
        let calculator = LinearCorrection::new(binding(None)).expect("calculator should build");
        let mut records = vec![Pad::replicate("r1").with_number("d45", 3.0)];
        calculator
            .calculate(&mut records, 0, None)
            .expect("calculate should succeed");
        assert_eq!(records[0].get_f64("d45_corr"), Some(3.0));
    }

    #[test]
    fn calculate_missing_raw_expected_missing_input() {
        let calculator = LinearCorrection::new(binding(None)).expect("calculator should build");
        let mut records = vec![Pad::replicate("r1")];
        let error = calculator
            .calculate(&mut records, 0, None)
            .expect_err("calculate should fail");
        assert_eq!(error, StepError::missing_input("raw"));
    }

    #[test]
    fn new_non_numeric_slope_expected_invalid_parameter() {
        let error = LinearCorrection::new(binding(Some(
            StepParams::new(0).with("slope", json!("steep")),
        )))
        .expect_err("construction should fail");
        assert!(matches!(error, StepError::InvalidParameter { name, .. } if name == "slope"));
    }
}
