//! Discriminator / generator step scheduling.
//!
//! The schedule is a pure function of `(state, step, cadence)`; the driver
//! owns the state and threads it through [`advance`] once per step.

use mmd_common::{TrainError, TrainingConfig};

/// Steps below this index use the warm-up discriminator count.
const WARMUP_STEPS: usize = 20;
/// Every multiple of this index re-enters warm-up for one cycle.
const REWARMUP_EVERY: usize = 500;

// ── Cadence ─────────────────────────────────────────────────────────────────

/// Discriminator/generator update ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub dsteps: usize,
    pub start_dsteps: usize,
    pub gsteps: usize,
}

impl Cadence {
    pub fn new(dsteps: usize, start_dsteps: usize, gsteps: usize) -> Result<Self, TrainError> {
        if gsteps == 0 {
            return Err(TrainError::Config("gsteps must be at least 1".into()));
        }
        Ok(Self {
            dsteps,
            start_dsteps,
            gsteps,
        })
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainError> {
        Self::new(config.dsteps, config.start_dsteps, config.gsteps)
    }

    /// Discriminator updates per cycle at `step`.
    pub fn d_steps_at(&self, step: usize) -> usize {
        if step < WARMUP_STEPS || step % REWARMUP_EVERY == 0 {
            self.start_dsteps
        } else {
            self.dsteps
        }
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerState {
    pub d_counter: usize,
    pub g_counter: usize,
    /// Consecutive telemetry failures; forces the next summary.
    pub err_counter: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Discriminator,
    Generator,
}

impl StepKind {
    pub fn is_generator(&self) -> bool {
        matches!(self, Self::Generator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discriminator => "d",
            Self::Generator => "g",
        }
    }
}

/// One transition of the schedule. Called exactly once per step, before any
/// update is applied.
pub fn advance(state: SchedulerState, step: usize, cadence: &Cadence) -> (SchedulerState, StepKind) {
    let d_steps = cadence.d_steps_at(step);
    let mut next = state;
    if next.g_counter == 0 {
        next.d_counter = (next.d_counter + 1) % (d_steps + 1);
    }
    if next.d_counter == 0 {
        next.g_counter = (next.g_counter + 1) % cadence.gsteps;
    }
    let kind = if next.d_counter != 0 {
        StepKind::Discriminator
    } else {
        StepKind::Generator
    };
    (next, kind)
}

/// Dense summaries early, sparse later, immediately after a failed one.
pub fn should_emit_summary(step: usize, err_counter: usize) -> bool {
    (step % 50 == 0 && step < 1000) || step % 1000 == 0 || err_counter > 0
}

impl SchedulerState {
    pub fn record_summary_failure(&mut self) {
        self.err_counter += 1;
    }

    pub fn record_summary_success(&mut self) {
        self.err_counter = 0;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cadence: &Cadence, steps: std::ops::Range<usize>, state: &mut SchedulerState) -> Vec<StepKind> {
        steps
            .map(|step| {
                let (next, kind) = advance(*state, step, cadence);
                *state = next;
                kind
            })
            .collect()
    }

    #[test]
    fn warmup_then_steady_state() {
        let cadence = Cadence::new(5, 1, 1).unwrap();
        let mut state = SchedulerState::default();
        let warm = run(&cadence, 0..20, &mut state);
        for (step, kind) in warm.iter().enumerate() {
            let expected = if step % 2 == 0 {
                StepKind::Discriminator
            } else {
                StepKind::Generator
            };
            assert_eq!(*kind, expected, "step {step}");
        }
        let steady = run(&cadence, 20..32, &mut state);
        use StepKind::{Discriminator as D, Generator as G};
        assert_eq!(steady, vec![D, D, D, D, D, G, D, D, D, D, D, G]);
    }

    #[test]
    fn one_generator_step_per_cycle() {
        let cadence = Cadence::new(3, 3, 1).unwrap();
        let mut state = SchedulerState::default();
        let kinds = run(&cadence, 21..21 + 400, &mut state);
        let g = kinds.iter().filter(|k| k.is_generator()).count();
        assert_eq!(g, 100);
    }

    #[test]
    fn zero_dsteps_always_updates_generator() {
        let cadence = Cadence::new(0, 0, 1).unwrap();
        let mut state = SchedulerState::default();
        assert!(run(&cadence, 0..50, &mut state).iter().all(|k| k.is_generator()));
    }

    #[test]
    fn multiple_generator_steps() {
        let cadence = Cadence::new(2, 2, 2).unwrap();
        let mut state = SchedulerState::default();
        use StepKind::{Discriminator as D, Generator as G};
        assert_eq!(run(&cadence, 30..38, &mut state), vec![D, D, G, G, D, D, G, G]);
    }

    #[test]
    fn rewarmup_on_multiples_of_500() {
        let cadence = Cadence::new(5, 10, 1).unwrap();
        assert_eq!(cadence.d_steps_at(19), 10);
        assert_eq!(cadence.d_steps_at(20), 5);
        assert_eq!(cadence.d_steps_at(500), 10);
        assert_eq!(cadence.d_steps_at(501), 5);
    }

    #[test]
    fn zero_gsteps_rejected() {
        assert!(Cadence::new(5, 10, 0).is_err());
    }

    #[test]
    fn summary_predicate() {
        assert!(should_emit_summary(0, 0));
        assert!(should_emit_summary(950, 0));
        assert!(!should_emit_summary(1050, 0));
        assert!(should_emit_summary(2000, 0));
        assert!(!should_emit_summary(7, 0));
        assert!(should_emit_summary(7, 1));
    }

    #[test]
    fn err_counter_resets_on_success() {
        let mut state = SchedulerState::default();
        state.record_summary_failure();
        state.record_summary_failure();
        assert_eq!(state.err_counter, 2);
        state.record_summary_success();
        assert_eq!(state.err_counter, 0);
    }
}
