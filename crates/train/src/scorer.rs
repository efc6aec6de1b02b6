//! Sample-quality scoring during training.
//!
//! A scorer is consulted on generator steps when `compute_scores` is set.
//! Its failures are logged and ignored. A scorer may ask the driver to run
//! the decay ops, which is how a plateau in sample quality lowers the
//! learning rate.

use candle_core::Tensor;
use parking_lot::Mutex;

use mmd_core::kernel::{mmd2_between, scalar_f32, MixRbfKernel};

/// What a scorer sees.
pub struct ScoreContext<'a> {
    /// Generator output for the frozen sample latents, `(n, c, h, w)`.
    pub samples: &'a Tensor,
    /// A fresh batch of real images.
    pub real: &'a Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    pub step: usize,
    /// Lower is better.
    pub score: f32,
    pub request_decay: bool,
}

pub trait Scorer: Send + Sync {
    /// Whether `compute` should run at `step`.
    fn is_due(&self, step: usize) -> bool;

    fn compute(&self, ctx: &ScoreContext<'_>, step: usize) -> anyhow::Result<ScoreOutcome>;
}

#[derive(Debug, Default)]
struct PlateauState {
    best: Option<f32>,
    bad_rounds: usize,
    last: Option<ScoreOutcome>,
}

/// Pixel-space MMD² between generated and real images under a mixture of
/// Gaussian kernels, with patience-based decay requests.
pub struct MmdScorer {
    every: usize,
    patience: usize,
    kernel: MixRbfKernel,
    state: Mutex<PlateauState>,
}

impl MmdScorer {
    pub fn new(every: usize, patience: usize) -> Self {
        Self {
            every: every.max(1),
            patience: patience.max(1),
            kernel: MixRbfKernel::default(),
            state: Mutex::new(PlateauState::default()),
        }
    }

    /// Most recent outcome.
    pub fn last(&self) -> Option<ScoreOutcome> {
        self.state.lock().last
    }

    /// Lowest score seen so far.
    pub fn best(&self) -> Option<f32> {
        self.state.lock().best
    }
}

impl Default for MmdScorer {
    fn default() -> Self {
        Self::new(2000, 3)
    }
}

impl Scorer for MmdScorer {
    fn is_due(&self, step: usize) -> bool {
        step % self.every == 0
    }

    fn compute(&self, ctx: &ScoreContext<'_>, step: usize) -> anyhow::Result<ScoreOutcome> {
        let fake = ctx.samples.flatten_from(1)?.detach();
        let real = ctx.real.flatten_from(1)?.detach();
        let score = scalar_f32(&mmd2_between(&self.kernel, &fake, &real)?)?;
        if !score.is_finite() {
            anyhow::bail!("non-finite score {score} at step {step}");
        }

        let mut state = self.state.lock();
        let improved = state.best.map_or(true, |best| score < best);
        let request_decay = if improved {
            state.best = Some(score);
            state.bad_rounds = 0;
            false
        } else {
            state.bad_rounds += 1;
            if state.bad_rounds >= self.patience {
                state.bad_rounds = 0;
                true
            } else {
                false
            }
        };
        let outcome = ScoreOutcome {
            step,
            score,
            request_decay,
        };
        state.last = Some(outcome);
        tracing::info!(step, score, request_decay, "score computed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn images(offset: f32) -> Tensor {
        (Tensor::rand(0f32, 0.1f32, (8, 1, 3, 3), &Device::Cpu).unwrap() + offset as f64).unwrap()
    }

    #[test]
    fn closer_samples_score_lower() {
        let scorer = MmdScorer::new(1, 3);
        let real = images(0.5);
        let near = images(0.5);
        let far = images(5.0);
        let s_near = scorer.compute(&ScoreContext { samples: &near, real: &real }, 0).unwrap();
        let s_far = scorer.compute(&ScoreContext { samples: &far, real: &real }, 1).unwrap();
        assert!(s_near.score < s_far.score);
        assert_eq!(scorer.last(), Some(s_far));
        assert_eq!(scorer.best(), Some(s_near.score));
    }

    #[test]
    fn plateau_requests_decay_after_patience() {
        let scorer = MmdScorer::new(1, 2);
        let real = images(0.0);
        let good = images(0.0);
        let bad = images(3.0);
        let decays = |samples: &Tensor, step| {
            let ctx = ScoreContext { samples, real: &real };
            scorer.compute(&ctx, step).unwrap().request_decay
        };
        assert!(!decays(&good, 0));
        assert!(!decays(&bad, 1));
        assert!(decays(&bad, 2));
        // Counter restarts after a request.
        assert!(!decays(&bad, 3));
    }

    #[test]
    fn due_on_multiples() {
        let scorer = MmdScorer::new(500, 1);
        assert!(scorer.is_due(0));
        assert!(scorer.is_due(1000));
        assert!(!scorer.is_due(750));
    }
}
