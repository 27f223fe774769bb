use crate::calculators::registry::{StepContract, StepController};
use crate::{
    Accumulator, DependencyManager, Pad, PadKind, RecordStatus, SampleCalculator, StepBinding,
    StepCalculator, StepError, StepRuntime, target_pad_mut,
};

pub const TAG: &str = "replicate_mean";

pub fn controller() -> StepController {
    StepController::new(
        TAG,
        StepContract::sample().required_input("value").output("mean"),
        |binding| Ok(StepRuntime::sample(ReplicateMean { binding })),
    )
}

/// Aggregates one replicate column into a statistic on the sample.
/// Replicates that finished in ERROR are excluded.
#[derive(Debug)]
pub struct ReplicateMean {
    binding: StepBinding,
}

impl StepCalculator for ReplicateMean {
    fn binding(&self) -> &StepBinding {
        &self.binding
    }

    fn calculate(
        &self,
        records: &mut [Pad],
        target: usize,
        _dependencies: Option<&DependencyManager>,
    ) -> Result<(), StepError> {
        let sample = target_pad_mut(records, target)?;
        let values: Vec<f64> = sample
            .children()
            .iter()
            .filter(|child| child.kind == PadKind::Replicate)
            .filter(|child| child.status() != Some(RecordStatus::Error))
            .filter_map(|child| self.binding.get_double(child, "value"))
            .collect();
        let accumulator = Accumulator::from_values(&values).ok_or_else(|| {
            StepError::calculation(format!("sample {} has no replicate values", sample.id))
        })?;
        self.binding.set_accumulator(sample, "mean", accumulator);
        Ok(())
    }
}

impl SampleCalculator for ReplicateMean {}
