//! Correction-interval steps: an interval-wide offset derived from the
//! standards measured in the same interval, and its application.

use crate::calculators::registry::{StepContract, StepController};
use crate::{
    DependencyKey, DependencyManager, Pad, ReferenceKind, ReferencePlugin, ReplicateCalculator,
    StepBinding, StepCalculator, StepError, StepRuntime, target_pad, target_pad_mut,
};

pub const OFFSET_TAG: &str = "interval_offset";
pub const CORRECTION_TAG: &str = "offset_correction";
pub const INTERVAL_PLUGIN: &str = "correction_interval";
const DEFAULT_INTERVAL_COLUMN: &str = "interval_id";

pub fn offset_controller() -> StepController {
    StepController::new(
        OFFSET_TAG,
        StepContract::replicate()
            .required_input("measured")
            .optional_input("accepted")
            .optional_input("is_standard")
            .optional_input("interval_id")
            .output("offset"),
        |binding| Ok(StepRuntime::replicate(IntervalOffset { binding })),
    )
}

pub fn correction_controller() -> StepController {
    StepController::new(
        CORRECTION_TAG,
        StepContract::replicate()
            .required_input("measured")
            .required_input("offset")
            .output("corrected"),
        |binding| Ok(StepRuntime::replicate(OffsetCorrection { binding })),
    )
}

/// Mean `accepted - measured` over the standards of the target's
/// correction interval. Only relevant while building interval context.
#[derive(Debug)]
pub struct IntervalOffset {
    binding: StepBinding,
}

impl IntervalOffset {
    fn interval_column(&self) -> &str {
        self.binding
            .label_to_column_name("interval_id")
            .unwrap_or(DEFAULT_INTERVAL_COLUMN)
    }
}

impl StepCalculator for IntervalOffset {
    fn binding(&self) -> &StepBinding {
        &self.binding
    }

    fn dependency_manager(&self, records: &[Pad], target: usize) -> Option<DependencyManager> {
        let plugin = match target_pad(records, target)
            .ok()
            .and_then(|pad| pad.get_str(self.interval_column()))
        {
            Some(id) => ReferencePlugin::new(
                INTERVAL_PLUGIN,
                DependencyKey::new(ReferenceKind::CorrectionInterval, id),
            ),
            None => ReferencePlugin::unavailable(
                INTERVAL_PLUGIN,
                "record is not assigned to a correction interval",
            ),
        };
        Some(DependencyManager::new().with_plugin(plugin))
    }

    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        _dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        let column = self.interval_column();
        let interval = target_pad(records, target)?
            .get_str(column)
            .map(ToOwned::to_owned)
            .ok_or_else(|| StepError::missing_input("interval_id"))?;

        let differences: Vec<f64> = records
            .iter()
            .filter(|pad| pad.get_str(column) == Some(interval.as_str()))
            .filter(|pad| !pad.has_errors() && self.binding.is_true(pad, "is_standard"))
            .filter_map(|pad| {
                let accepted = self.binding.get_double(pad, "accepted")?;
                let measured = self.binding.get_double(pad, "measured")?;
                Some(accepted - measured)
            })
            .collect();
        if differences.is_empty() {
            return Err(StepError::calculation(format!(
                "correction interval {interval} has no usable standards"
            )));
        }
        let offset = differences.iter().sum::<f64>() / differences.len() as f64;

        let pad = target_pad_mut(records, target)?;
        self.binding.set_double(pad, "offset", offset);
        Ok(())
    }
}

impl ReplicateCalculator for IntervalOffset {
    fn applies_to_results(&self) -> bool {
        false
    }
}

/// `corrected = measured + offset`.
#[derive(Debug)]
pub struct OffsetCorrection {
    binding: StepBinding,
}

impl StepCalculator for OffsetCorrection {
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
        let measured = self.binding.require_double(pad, "measured")?;
        let offset = self.binding.require_double(pad, "offset")?;
        self.binding.set_double(pad, "corrected", measured + offset);
        Ok(())
    }
}

impl ReplicateCalculator for OffsetCorrection {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PadValue, StepConfig};

    fn offset_step() -> IntervalOffset {
        let step = StepConfig::new(1, OFFSET_TAG)
            .input("measured", "d13c")
            .input("accepted", "d13c_true")
            .input("is_standard", "is_std")
            .output("offset", "ci_offset");
        IntervalOffset {
            binding: StepBinding::new(&step, None),
        }
    }

    fn standard(id: &str, interval: &str, measured: f64, accepted: f64) -> Pad {
        Pad::replicate(id)
            .with_text("interval_id", interval)
            .with_number("d13c", measured)
            .with_number("d13c_true", accepted)
            .with_value("is_std", PadValue::Flag(true))
    }

    #[test]
    fn calculate_expected_mean_offset_of_same_interval_standards() {
        let step = offset_step();
        let mut records = vec![
            standard("s1", "ci-1", 1.0, 1.5),
            standard("s2", "ci-1", 2.0, 2.3),
            standard("s3", "ci-2", 0.0, 9.0),
            Pad::replicate("u1")
                .with_text("interval_id", "ci-1")
                .with_number("d13c", 4.0),
        ];

        step.calculate(&mut records, 3, None)
            .expect("calculate should succeed");
        let offset = records[3].get_f64("ci_offset").expect("offset written");
        assert!((offset - 0.4).abs() < 1e-12);
    }

    #[test]
    fn calculate_interval_without_standards_expected_error() {
        let step = offset_step();
        let mut records = vec![
            Pad::replicate("u1")
                .with_text("interval_id", "ci-9")
                .with_number("d13c", 4.0),
        ];
        let error = step
            .calculate(&mut records, 0, None)
            .expect_err("calculate should fail");
        assert!(error.to_string().contains("ci-9"));
    }

    #[test]
    fn interval_offset_applies_to_context_only() {
        let step = offset_step();
        assert!(step.applies_to_context());
        assert!(!step.applies_to_results());
    }

    #[test]
    fn offset_correction_expected_measured_plus_offset() {
        let step = StepConfig::new(2, CORRECTION_TAG)
            .input("measured", "d13c")
            .input("offset", "ci_offset")
            .output("corrected", "d13c_vpdb");
        let calculator = OffsetCorrection {
            binding: StepBinding::new(&step, None),
        };
        let mut records = vec![
            Pad::replicate("u1")
                .with_number("d13c", 4.0)
                .with_number("ci_offset", 0.5),
        ];
        calculator
            .calculate(&mut records, 0, None)
            .expect("calculate should succeed");
        assert_eq!(records[0].get_f64("d13c_vpdb"), Some(4.5));
    }
}
