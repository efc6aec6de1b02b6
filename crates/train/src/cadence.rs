//! Step predicates for the periodic side effects of a run.
//!
//! All of them only fire on generator-update steps.

use std::collections::BTreeSet;

use crate::scheduler::StepKind;

pub const CHECKPOINT_EVERY: usize = 2000;
pub const SAMPLE_EVERY: usize = 1000;
pub const LAYER_DUMP_EVERY: usize = 1000;
/// Rows written per layer in a layer-output dump.
pub const LAYER_DUMP_ROWS: usize = 256;
/// How many of the sorted discriminator layers (from the end) are dumped.
pub const LAYER_DUMP_LAST: usize = 2;

pub fn should_checkpoint(step: usize, kind: StepKind) -> bool {
    kind.is_generator() && step % CHECKPOINT_EVERY == 0
}

pub fn should_sample(step: usize, kind: StepKind) -> bool {
    kind.is_generator() && step % SAMPLE_EVERY == 0
}

/// Steps at which intermediate discriminator outputs are written.
///
/// Multiples of 1000 up to the iteration budget, plus `⌊c^k⌋` for
/// `k < log_c(1000)` when the multiplier `c` exceeds 1. A multiplier of 0
/// disables the dump entirely.
#[derive(Debug, Clone, Default)]
pub struct LayerDumpSchedule {
    steps: BTreeSet<usize>,
}

impl LayerDumpSchedule {
    pub fn new(multiplier: f64, max_iteration: usize) -> Self {
        let mut steps = BTreeSet::new();
        if multiplier <= 0.0 {
            return Self { steps };
        }
        for k in 0..=max_iteration / LAYER_DUMP_EVERY {
            steps.insert(k * LAYER_DUMP_EVERY);
        }
        if multiplier > 1.0 {
            let bound = (LAYER_DUMP_EVERY as f64).ln() / multiplier.ln();
            let mut k = 0;
            while (k as f64) < bound {
                steps.insert(multiplier.powi(k).floor() as usize);
                k += 1;
            }
        }
        Self { steps }
    }

    pub fn is_enabled(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn should_dump(&self, step: usize, kind: StepKind) -> bool {
        kind.is_generator() && self.steps.contains(&step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: StepKind = StepKind::Generator;
    const D: StepKind = StepKind::Discriminator;

    #[test]
    fn side_effects_only_on_generator_steps() {
        assert!(should_checkpoint(4000, G));
        assert!(!should_checkpoint(4000, D));
        assert!(!should_checkpoint(3000, G));
        assert!(should_sample(3000, G));
        assert!(!should_sample(3000, D));
    }

    #[test]
    fn linear_schedule() {
        let s = LayerDumpSchedule::new(1.0, 5000);
        assert!(s.should_dump(0, G));
        assert!(s.should_dump(5000, G));
        assert!(!s.should_dump(6000, G));
        assert!(!s.should_dump(2, G));
        assert!(!s.should_dump(1000, D));
    }

    #[test]
    fn geometric_schedule() {
        let s = LayerDumpSchedule::new(2.0, 3000);
        // 2^0 .. 2^9 (log2(1000) ≈ 9.97).
        for step in [1, 2, 4, 8, 256, 512] {
            assert!(s.should_dump(step, G), "{step}");
        }
        assert!(!s.should_dump(1024, G));
        assert!(!s.should_dump(3, G));
        assert!(s.should_dump(2000, G));
    }

    #[test]
    fn fractional_multiplier_floors() {
        let s = LayerDumpSchedule::new(1.5, 0);
        // 1.5^2 = 2.25, 1.5^3 = 3.375
        assert!(s.should_dump(2, G));
        assert!(s.should_dump(3, G));
    }

    #[test]
    fn disabled() {
        let s = LayerDumpSchedule::new(0.0, 10_000);
        assert!(!s.is_enabled());
        assert!(!s.should_dump(0, G));
    }
}
