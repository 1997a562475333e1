use serde::{Deserialize, Serialize};

/// Fraction at which a run counts as finishing rather than generating.
const FINISHING_THRESHOLD: f64 = 0.95;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum GenerationPhase {
    #[default]
    Idle,
    Preparing,
    Generating,
    Finishing,
    Done,
}

impl GenerationPhase {
    pub fn for_fraction(fraction: f64) -> Self {
        if fraction <= 0.0 {
            Self::Preparing
        } else if fraction < FINISHING_THRESHOLD {
            Self::Generating
        } else if fraction < 1.0 {
            Self::Finishing
        } else {
            Self::Done
        }
    }
}

/// Progress of the current generation run, derived from console output.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub value: f64,
    pub phase: GenerationPhase,
}

impl GenerationProgress {
    /// Folds a parsed percentage into the run. Within a run the value never
    /// decreases; a lower value means the engine started the next run.
    ///
    /// Returns true when the published value changed.
    pub fn observe(&mut self, fraction: f64) -> bool {
        let fraction = fraction.clamp(0.0, 1.0);
        let next = Self {
            value: fraction,
            phase: GenerationPhase::for_fraction(fraction),
        };
        if next == *self {
            return false;
        }
        *self = next;
        true
    }

    /// Returns true when the value was not already reset.
    pub fn reset(&mut self) -> bool {
        let changed = *self != Self::default();
        *self = Self::default();
        changed
    }
}
