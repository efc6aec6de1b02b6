//! Optimizer bank and decayable hyper-parameters.

use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use mmd_common::TrainingConfig;
use mmd_core::{Group, ParameterGroups};

/// Learning rates never decay below this value.
pub const MIN_LEARNING_RATE: f64 = 1e-6;

// ── Hyper state ─────────────────────────────────────────────────────────────

/// Values that change during a run and are persisted with checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperState {
    /// Generator learning rate.
    pub lr: f64,
    /// Gradient-penalty coefficient.
    pub gp: f64,
    /// Scaling coefficient.
    pub sc: f64,
}

impl HyperState {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            gp: config.gradient_penalty,
            sc: config.scaling_coeff,
        }
    }

    /// `lr ← max(lr · rate, 1e-6)`.
    pub fn decay_lr(&mut self, rate: f64) {
        self.lr = (self.lr * rate).max(MIN_LEARNING_RATE);
    }

    pub fn decay_gp(&mut self, rate: f64) {
        self.gp *= rate;
    }

    pub fn decay_sc(&mut self, rate: f64) {
        self.sc *= rate;
    }
}

// ── Optimizer bank ──────────────────────────────────────────────────────────

/// One Adam optimizer per parameter group.
pub struct OptimizerBank {
    generator: AdamW,
    discriminator: AdamW,
    /// `learning_rate_d / learning_rate`, fixed for the run.
    d_ratio: f64,
}

impl OptimizerBank {
    pub fn new(config: &TrainingConfig, groups: &ParameterGroups, lr: f64) -> anyhow::Result<Self> {
        let d_ratio = config.learning_rate_d() / config.learning_rate;
        let params = |lr: f64| ParamsAdamW {
            lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let generator = AdamW::new(groups.vars(Group::Generator), params(lr))?;
        let discriminator = AdamW::new(groups.vars(Group::Discriminator), params(lr * d_ratio))?;
        tracing::info!(
            g_params = groups.num_params(Group::Generator),
            d_params = groups.num_params(Group::Discriminator),
            lr,
            d_lr = lr * d_ratio,
            "optimizers set"
        );
        Ok(Self {
            generator,
            discriminator,
            d_ratio,
        })
    }

    /// Propagate a (decayed or restored) generator rate to both optimizers.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.generator.set_learning_rate(lr);
        self.discriminator.set_learning_rate(lr * self.d_ratio);
    }

    pub fn learning_rate(&self, group: Group) -> f64 {
        match group {
            Group::Generator => self.generator.learning_rate(),
            Group::Discriminator => self.discriminator.learning_rate(),
        }
    }

    /// Apply one Adam update to `group` only.
    pub fn apply(&mut self, group: Group, grads: &GradStore) -> anyhow::Result<()> {
        match group {
            Group::Generator => self.generator.step(grads)?,
            Group::Discriminator => self.discriminator.step(grads)?,
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarMap};

    #[test]
    fn lr_decay_twice() {
        let mut h = HyperState {
            lr: 1e-3,
            gp: 1.0,
            sc: 1.0,
        };
        h.decay_lr(0.5);
        h.decay_lr(0.5);
        assert!((h.lr - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn lr_decay_floors() {
        let mut h = HyperState {
            lr: 1e-3,
            gp: 0.0,
            sc: 1.0,
        };
        for _ in 0..100 {
            h.decay_lr(0.5);
        }
        assert_eq!(h.lr, MIN_LEARNING_RATE);
    }

    #[test]
    fn penalty_decay_is_multiplicative() {
        let mut h = HyperState {
            lr: 1e-3,
            gp: 10.0,
            sc: 2.0,
        };
        h.decay_gp(0.5);
        h.decay_sc(0.25);
        assert_eq!(h.gp, 5.0);
        assert_eq!(h.sc, 0.5);
    }

    #[test]
    fn discriminator_rate_follows_ratio() {
        let varmap = VarMap::new();
        for name in ["g_w", "d_w"] {
            varmap.get(2, name, Init::Const(1.0), DType::F32, &Device::Cpu).unwrap();
        }
        let groups = ParameterGroups::partition(&varmap).unwrap();
        let config = TrainingConfig {
            learning_rate: 1e-4,
            learning_rate_d: Some(4e-4),
            ..Default::default()
        };
        let mut bank = OptimizerBank::new(&config, &groups, config.learning_rate).unwrap();
        assert!((bank.learning_rate(Group::Discriminator) - 4e-4).abs() < 1e-12);
        bank.set_learning_rate(5e-5);
        assert!((bank.learning_rate(Group::Generator) - 5e-5).abs() < 1e-12);
        assert!((bank.learning_rate(Group::Discriminator) - 2e-4).abs() < 1e-12);
    }

    #[test]
    fn apply_touches_only_one_group() {
        let varmap = VarMap::new();
        let g = varmap.get(2, "g_w", Init::Const(1.0), DType::F32, &Device::Cpu).unwrap();
        let d = varmap.get(2, "d_w", Init::Const(1.0), DType::F32, &Device::Cpu).unwrap();
        let groups = ParameterGroups::partition(&varmap).unwrap();
        let mut bank = OptimizerBank::new(&TrainingConfig::default(), &groups, 0.1).unwrap();
        let grads = (g.sum_all().unwrap() + d.sum_all().unwrap()).unwrap().backward().unwrap();
        bank.apply(Group::Discriminator, &grads).unwrap();
        assert_eq!(g.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert!(d.to_vec1::<f32>().unwrap().iter().all(|&v| v < 1.0));
    }
}
