//! Replica execution.
//!
//! Every tower shares the canonical networks and parameter groups, takes its
//! own real shard and latent batch, and reports losses plus detached
//! gradients for both groups. Towers run on the rayon pool and the call
//! returns only once all of them have finished.

use candle_core::{backprop::GradStore, Device, Tensor};
use rayon::prelude::*;

use mmd_common::Batch;
use mmd_core::{
    kernel::scalar_f32, Coefficients, Discriminator, Generator, Group, LossComposer, LossDiagnostics,
    LossInputs, ParameterGroups, StatUpdate, UpdateCollection,
};

use crate::aggregate::prepare_tower_gradients;

/// Read-only state shared by all towers of one step.
pub struct TowerShared<'a> {
    pub generator: &'a dyn Generator,
    pub discriminator: &'a dyn Discriminator,
    pub composer: &'a LossComposer,
    pub groups: &'a ParameterGroups,
    pub device: &'a Device,
    pub coeffs: Coefficients,
    /// Per-tensor clip norm, `None` when clipping is off.
    pub clip: Option<f64>,
}

/// Per-tower inputs.
pub struct TowerInput {
    pub shard: Batch,
    /// `(batch_size, z_dim)` latent batch.
    pub z: Tensor,
    /// Generator labels, `(batch_size,)`.
    pub labels: Option<Tensor>,
}

pub struct TowerOutput {
    pub index: usize,
    pub g_loss: f32,
    pub d_loss: f32,
    pub g_grads: GradStore,
    pub d_grads: GradStore,
    pub updates: Vec<StatUpdate>,
    pub diagnostics: LossDiagnostics,
}

/// Forward, loss and both backward passes of one replica.
pub fn run_tower(shared: &TowerShared<'_>, index: usize, input: TowerInput) -> anyhow::Result<TowerOutput> {
    let images = input.shard.images.to_device(shared.device)?;
    let real_labels = input
        .shard
        .labels
        .map(|l| l.to_device(shared.device))
        .transpose()?;
    let z = input.z.to_device(shared.device)?;
    let fake_labels = input.labels.map(|l| l.to_device(shared.device)).transpose()?;
    let real_bs = images.dim(0)?;
    let fake_bs = z.dim(0)?;

    let generated = shared
        .generator
        .generate(&z, fake_bs, fake_labels.as_ref(), UpdateCollection::Collect)?;
    let real_layers = shared.discriminator.discriminate(
        &images,
        real_bs,
        real_labels.as_ref(),
        UpdateCollection::Collect,
    )?;
    let fake_layers = shared.discriminator.discriminate(
        &generated.samples,
        fake_bs,
        fake_labels.as_ref(),
        UpdateCollection::Collect,
    )?;

    let loss = shared.composer.compose(
        &LossInputs {
            discriminator: shared.discriminator,
            real_images: &images,
            fake_images: &generated.samples,
            real_layers: &real_layers,
            fake_layers: &fake_layers,
            labels: real_labels.as_ref(),
        },
        shared.coeffs,
    )?;

    let mut g_grads = loss.g_loss.backward()?;
    prepare_tower_gradients(&mut g_grads, shared.groups.get(Group::Generator), shared.clip, index)?;
    let mut d_grads = loss.d_loss.backward()?;
    prepare_tower_gradients(&mut d_grads, shared.groups.get(Group::Discriminator), shared.clip, index)?;

    Ok(TowerOutput {
        index,
        g_loss: scalar_f32(&loss.g_loss)?,
        d_loss: scalar_f32(&loss.d_loss)?,
        g_grads,
        d_grads,
        updates: generated.updates,
        diagnostics: loss.diagnostics,
    })
}

/// Run every tower in parallel and wait for all of them.
pub fn run_towers(shared: &TowerShared<'_>, inputs: Vec<TowerInput>) -> anyhow::Result<Vec<TowerOutput>> {
    if inputs.len() == 1 {
        return inputs
            .into_iter()
            .map(|input| run_tower(shared, 0, input))
            .collect();
    }
    let mut outputs: Vec<TowerOutput> = inputs
        .into_par_iter()
        .enumerate()
        .map(|(i, input)| run_tower(shared, i, input))
        .collect::<anyhow::Result<_>>()?;
    outputs.sort_by_key(|o| o.index);
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use mmd_common::TrainingConfig;
    use mmd_core::build_networks;

    fn tiny() -> TrainingConfig {
        TrainingConfig {
            output_size: 3,
            z_dim: 2,
            gf_dim: 2,
            df_dim: 2,
            dof_dim: 3,
            ..Default::default()
        }
    }

    fn input(rows: usize) -> TowerInput {
        TowerInput {
            shard: Batch {
                images: Tensor::rand(0f32, 1f32, (rows, 1, 3, 3), &Device::Cpu).unwrap(),
                labels: None,
            },
            z: Tensor::rand(-1f32, 1f32, (rows, 2), &Device::Cpu).unwrap(),
            labels: None,
        }
    }

    #[test]
    fn every_tower_reports_gradients_for_both_groups() {
        let config = tiny();
        let varmap = VarMap::new();
        let (g, d) = build_networks(&config, &varmap, &Device::Cpu).unwrap();
        let groups = ParameterGroups::partition(&varmap).unwrap();
        let composer = LossComposer::from_config(&config).unwrap();
        let shared = TowerShared {
            generator: g.as_ref(),
            discriminator: d.as_ref(),
            composer: &composer,
            groups: &groups,
            device: &Device::Cpu,
            coeffs: Coefficients { gp: 0.0, sc: 1.0 },
            clip: Some(1.0),
        };
        let outputs = run_towers(&shared, vec![input(4), input(4), input(4)]).unwrap();
        assert_eq!(outputs.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        for out in &outputs {
            assert!((out.g_loss + out.d_loss).abs() < 1e-6);
            for (_, var) in groups.get(Group::Generator) {
                assert!(out.g_grads.get(var.as_tensor()).is_some());
            }
            for (_, var) in groups.get(Group::Discriminator) {
                let grad = out.d_grads.get(var.as_tensor()).unwrap();
                let norm = grad.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap().sqrt();
                assert!(norm <= 1.0 + 1e-5);
            }
        }
    }
}
