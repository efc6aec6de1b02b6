//! Generator / discriminator contracts and the reference MLP pair.
//!
//! The training core only relies on [`Generator`] and [`Discriminator`]. Any
//! network works as long as its generator variables live under `g_*` names
//! and its discriminator variables under `d_*` names (see
//! [`crate::params::ParameterGroups`]).

use std::collections::BTreeMap;

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{embedding, linear, ops, Embedding, Init, Linear, Module, VarBuilder, VarMap};

use mmd_common::TrainingConfig;

/// Layer key of the final feature embedding fed to the kernel.
pub const FEATURE_KEY: &str = "hF";

const BN_MOMENTUM: f64 = 0.9;
const BN_EPS: f64 = 1e-5;
const LEAKY_SLOPE: f64 = 0.2;

/// Whether a forward pass should report normalisation-statistic updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCollection {
    /// Collect running-statistic updates (training branches).
    Collect,
    /// Compute with batch statistics, report nothing (sampling, penalties).
    NoOps,
}

/// New value for a non-trainable variable, applied by the driver after the
/// optimiser step.
#[derive(Debug, Clone)]
pub struct StatUpdate {
    pub name: String,
    pub var: Var,
    pub value: Tensor,
}

/// Generator output.
pub struct Generated {
    /// `(batch, c, h, w)` samples in `[0, 1]`.
    pub samples: Tensor,
    pub updates: Vec<StatUpdate>,
}

/// Named intermediate activations of one discriminator pass, sorted by name.
#[derive(Debug, Clone, Default)]
pub struct LayerOutputs(BTreeMap<String, Tensor>);

impl LayerOutputs {
    pub fn insert(&mut self, name: impl Into<String>, t: Tensor) {
        self.0.insert(name.into(), t);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    /// The final embedding under [`FEATURE_KEY`].
    pub fn features(&self) -> Result<&Tensor> {
        self.0
            .get(FEATURE_KEY)
            .ok_or_else(|| Error::Msg(format!("discriminator returned no '{FEATURE_KEY}' layer")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub trait Generator: Send + Sync {
    fn generate(
        &self,
        z: &Tensor,
        batch_size: usize,
        labels: Option<&Tensor>,
        mode: UpdateCollection,
    ) -> Result<Generated>;
}

pub trait Discriminator: Send + Sync {
    /// Every captured layer, including [`FEATURE_KEY`].
    fn discriminate(
        &self,
        x: &Tensor,
        batch_size: usize,
        labels: Option<&Tensor>,
        mode: UpdateCollection,
    ) -> Result<LayerOutputs>;
}

/// Build the networks named by `config.architecture` into `varmap`.
pub fn build_networks(
    config: &TrainingConfig,
    varmap: &VarMap,
    device: &Device,
) -> anyhow::Result<(Box<dyn Generator>, Box<dyn Discriminator>)> {
    match config.architecture.as_str() {
        "mlp" => {
            let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
            let g = MlpGenerator::new(config, vb.clone(), varmap)?;
            let d = MlpDiscriminator::new(config, vb)?;
            Ok((Box::new(g), Box::new(d)))
        }
        other => Err(mmd_common::TrainError::Config(format!("unknown architecture '{other}'")).into()),
    }
}

// ── Batch statistics ────────────────────────────────────────────────────────

/// Batch normalisation over dimension 0 with running statistics kept as
/// non-trainable `*.running_mean` / `*.running_var` variables.
struct BatchStats {
    name: String,
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
}

fn stat_var(varmap: &VarMap, path: &str, dim: usize, value: f64, device: &Device) -> Result<Var> {
    varmap.get(dim, path, Init::Const(value), DType::F32, device)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Msg("varmap lock poisoned".into()))?;
    data.get(path)
        .cloned()
        .ok_or_else(|| Error::Msg(format!("variable '{path}' missing after creation")))
}

impl BatchStats {
    fn new(dim: usize, vb: VarBuilder, varmap: &VarMap) -> Result<Self> {
        let name = vb.prefix();
        let gamma = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let beta = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        let running_mean = stat_var(varmap, &format!("{name}.running_mean"), dim, 0.0, vb.device())?;
        let running_var = stat_var(varmap, &format!("{name}.running_var"), dim, 1.0, vb.device())?;
        Ok(Self {
            name,
            gamma,
            beta,
            running_mean,
            running_var,
        })
    }

    fn forward(&self, x: &Tensor, mode: UpdateCollection, updates: &mut Vec<StatUpdate>) -> Result<Tensor> {
        let mean = x.mean_keepdim(0)?;
        let centred = x.broadcast_sub(&mean)?;
        let var = centred.sqr()?.mean_keepdim(0)?;
        let normed = centred.broadcast_div(&var.affine(1.0, BN_EPS)?.sqrt()?)?;
        if mode == UpdateCollection::Collect {
            let blend = |running: &Var, batch: &Tensor| -> Result<Tensor> {
                running
                    .as_tensor()
                    .affine(BN_MOMENTUM, 0.0)?
                    .add(&batch.squeeze(0)?.detach().affine(1.0 - BN_MOMENTUM, 0.0)?)
            };
            updates.push(StatUpdate {
                name: format!("{}.running_mean", self.name),
                var: self.running_mean.clone(),
                value: blend(&self.running_mean, &mean)?,
            });
            updates.push(StatUpdate {
                name: format!("{}.running_var", self.name),
                var: self.running_var.clone(),
                value: blend(&self.running_var, &var)?,
            });
        }
        normed.broadcast_mul(&self.gamma)?.broadcast_add(&self.beta)
    }
}

// ── MlpGenerator ────────────────────────────────────────────────────────────

/// `z → [+label embedding] → h0 → h1 → sigmoid(out)` reshaped to images.
pub struct MlpGenerator {
    embed: Option<Embedding>,
    h0: Linear,
    bn0: Option<BatchStats>,
    h1: Linear,
    bn1: Option<BatchStats>,
    out: Linear,
    shape: (usize, usize, usize),
}

impl MlpGenerator {
    pub fn new(config: &TrainingConfig, vb: VarBuilder, varmap: &VarMap) -> Result<Self> {
        let hidden = config.gf_dim * 4;
        let embed = if config.with_labels {
            Some(embedding(config.num_classes, config.z_dim, vb.pp("g_embed"))?)
        } else {
            None
        };
        let (bn0, bn1) = if config.batch_norm {
            (
                Some(BatchStats::new(hidden, vb.pp("g_bn0"), varmap)?),
                Some(BatchStats::new(hidden, vb.pp("g_bn1"), varmap)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            embed,
            h0: linear(config.z_dim, hidden, vb.pp("g_h0"))?,
            bn0,
            h1: linear(hidden, hidden, vb.pp("g_h1"))?,
            bn1,
            out: linear(hidden, config.input_dim(), vb.pp("g_out"))?,
            shape: (config.c_dim, config.output_size, config.output_size),
        })
    }
}

impl Generator for MlpGenerator {
    fn generate(
        &self,
        z: &Tensor,
        batch_size: usize,
        labels: Option<&Tensor>,
        mode: UpdateCollection,
    ) -> Result<Generated> {
        let mut updates = Vec::new();
        let mut x = z.clone();
        if let (Some(embed), Some(labels)) = (&self.embed, labels) {
            x = (x + embed.forward(labels)?)?;
        }
        let mut h = self.h0.forward(&x)?;
        if let Some(bn) = &self.bn0 {
            h = bn.forward(&h, mode, &mut updates)?;
        }
        let mut h = self.h1.forward(&h.relu()?)?;
        if let Some(bn) = &self.bn1 {
            h = bn.forward(&h, mode, &mut updates)?;
        }
        let out = ops::sigmoid(&self.out.forward(&h.relu()?)?)?;
        let (c, height, width) = self.shape;
        Ok(Generated {
            samples: out.reshape((batch_size, c, height, width))?,
            updates,
        })
    }
}

// ── MlpDiscriminator ────────────────────────────────────────────────────────

/// `x → h0 [+label embedding] → h1 → hF`, leaky-ReLU between layers.
pub struct MlpDiscriminator {
    embed: Option<Embedding>,
    h0: Linear,
    h1: Linear,
    hf: Linear,
}

impl MlpDiscriminator {
    pub fn new(config: &TrainingConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.df_dim * 4;
        let embed = if config.with_labels {
            Some(embedding(config.num_classes, hidden, vb.pp("d_embed"))?)
        } else {
            None
        };
        Ok(Self {
            embed,
            h0: linear(config.input_dim(), hidden, vb.pp("d_h0"))?,
            h1: linear(hidden, hidden, vb.pp("d_h1"))?,
            hf: linear(hidden, config.dof_dim, vb.pp("d_hF"))?,
        })
    }
}

impl Discriminator for MlpDiscriminator {
    fn discriminate(
        &self,
        x: &Tensor,
        batch_size: usize,
        labels: Option<&Tensor>,
        _mode: UpdateCollection,
    ) -> Result<LayerOutputs> {
        let x = x.reshape((batch_size, ()))?;
        let mut h0 = ops::leaky_relu(&self.h0.forward(&x)?, LEAKY_SLOPE)?;
        if let (Some(embed), Some(labels)) = (&self.embed, labels) {
            h0 = (h0 + embed.forward(labels)?)?;
        }
        let h1 = ops::leaky_relu(&self.h1.forward(&h0)?, LEAKY_SLOPE)?;
        let hf = self.hf.forward(&h1)?;
        let mut layers = LayerOutputs::default();
        layers.insert("h0", h0);
        layers.insert("h1", h1);
        layers.insert(FEATURE_KEY, hf);
        Ok(layers)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            output_size: 4,
            z_dim: 3,
            gf_dim: 2,
            df_dim: 2,
            dof_dim: 5,
            ..Default::default()
        }
    }

    #[test]
    fn mlp_shapes_and_layer_names() {
        let config = small_config();
        let varmap = VarMap::new();
        let (g, d) = build_networks(&config, &varmap, &Device::Cpu).unwrap();
        let z = Tensor::rand(-1f32, 1f32, (6, 3), &Device::Cpu).unwrap();
        let out = g.generate(&z, 6, None, UpdateCollection::Collect).unwrap();
        assert_eq!(out.samples.dims(), &[6, 1, 4, 4]);
        assert!(out.updates.is_empty());
        let layers = d.discriminate(&out.samples, 6, None, UpdateCollection::NoOps).unwrap();
        assert_eq!(layers.keys(), vec!["h0", "h1", "hF"]);
        assert_eq!(layers.features().unwrap().dims(), &[6, 5]);
    }

    #[test]
    fn batch_norm_reports_updates_only_when_collecting() {
        let config = TrainingConfig {
            batch_norm: true,
            ..small_config()
        };
        let varmap = VarMap::new();
        let (g, _) = build_networks(&config, &varmap, &Device::Cpu).unwrap();
        let z = Tensor::rand(-1f32, 1f32, (4, 3), &Device::Cpu).unwrap();
        let collected = g.generate(&z, 4, None, UpdateCollection::Collect).unwrap();
        assert_eq!(collected.updates.len(), 4);
        assert_eq!(collected.updates[0].name, "g_bn0.running_mean");
        let silent = g.generate(&z, 4, None, UpdateCollection::NoOps).unwrap();
        assert!(silent.updates.is_empty());
    }

    #[test]
    fn label_conditioning_changes_output() {
        let config = TrainingConfig {
            with_labels: true,
            num_classes: 3,
            ..small_config()
        };
        let varmap = VarMap::new();
        let (g, _) = build_networks(&config, &varmap, &Device::Cpu).unwrap();
        let z = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let y0 = Tensor::new(&[0u32, 0], &Device::Cpu).unwrap();
        let y1 = Tensor::new(&[1u32, 1], &Device::Cpu).unwrap();
        let a = g.generate(&z, 2, Some(&y0), UpdateCollection::NoOps).unwrap().samples;
        let b = g.generate(&z, 2, Some(&y1), UpdateCollection::NoOps).unwrap().samples;
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn unknown_architecture() {
        let config = TrainingConfig {
            architecture: "dcgan64".into(),
            ..small_config()
        };
        assert!(build_networks(&config, &VarMap::new(), &Device::Cpu).is_err());
    }
}
