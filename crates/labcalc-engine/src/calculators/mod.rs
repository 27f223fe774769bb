//! Built-in step calculators and the registry that resolves step types.

use registry::{StepController, StepRegistry};

pub mod acid;
pub mod background;
pub mod interval;
pub mod linear;
pub mod registry;
pub mod replicate_mean;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinStep {
    LinearCorrection,
    Background,
    AcidFractionation,
    IntervalOffset,
    OffsetCorrection,
    ReplicateMean,
}

impl BuiltinStep {
    pub const ALL: [BuiltinStep; 6] = [
        Self::LinearCorrection,
        Self::Background,
        Self::AcidFractionation,
        Self::IntervalOffset,
        Self::OffsetCorrection,
        Self::ReplicateMean,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::LinearCorrection => linear::TAG,
            Self::Background => background::TAG,
            Self::AcidFractionation => acid::TAG,
            Self::IntervalOffset => interval::OFFSET_TAG,
            Self::OffsetCorrection => interval::CORRECTION_TAG,
            Self::ReplicateMean => replicate_mean::TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.tag() == tag.trim())
    }

    pub fn controller(self) -> StepController {
        match self {
            Self::LinearCorrection => linear::controller(),
            Self::Background => background::controller(),
            Self::AcidFractionation => acid::controller(),
            Self::IntervalOffset => interval::offset_controller(),
            Self::OffsetCorrection => interval::correction_controller(),
            Self::ReplicateMean => replicate_mean::controller(),
        }
    }
}

pub fn core_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in BuiltinStep::ALL {
        registry.register(step.controller());
    }
    registry
}
