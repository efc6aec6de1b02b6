//! Discriminator regularisers: gradient penalty, L2 activation penalty and
//! the Jacobian-norm scaling factor.
//!
//! The gradient penalty and the scaling factor differentiate through an input
//! gradient, so they need [`crate::autograd::enable_second_order`].

use anyhow::Context;
use candle_core::{DType, Tensor, Var};

use mmd_common::ScalingVariant;

use crate::autograd::{input_gradient, safer_norm};
use crate::kernel::{mean_similarity, Kernel};
use crate::networks::{Discriminator, LayerOutputs, UpdateCollection};

/// Standard deviation of the noise batch used by the scaling regulariser.
const SCALING_NOISE_STD: f32 = 10.0;

/// First `n` rows of `t`.
fn head(t: &Tensor, n: usize) -> candle_core::Result<Tensor> {
    if t.dim(0)? == n {
        Ok(t.clone())
    } else {
        t.narrow(0, 0, n)
    }
}

/// Per-example interpolation weights shaped to broadcast against `like`.
fn interpolation_weights(like: &Tensor) -> candle_core::Result<Tensor> {
    let mut shape = vec![1usize; like.rank()];
    shape[0] = like.dim(0)?;
    Tensor::rand(0f32, 1f32, shape, like.device())?.to_dtype(like.dtype())
}

/// Inputs of the gradient penalty. Images and features may have different
/// batch sizes for the real and generated branch.
pub struct PenaltyInputs<'a> {
    pub kernel: &'a dyn Kernel,
    pub discriminator: &'a dyn Discriminator,
    pub real_images: &'a Tensor,
    pub fake_images: &'a Tensor,
    pub real_features: &'a Tensor,
    pub fake_features: &'a Tensor,
    pub labels: Option<&'a Tensor>,
}

/// `mean((‖∇ₓ w(x̂)‖ − 1)²)` on random interpolates of the first
/// `min(real, fake)` rows, where `w` is the kernel witness function
/// `w(x) = mean_j k(D(x), real_j) − mean_j k(D(x), fake_j)`.
pub fn gradient_penalty(inputs: &PenaltyInputs<'_>) -> anyhow::Result<Tensor> {
    let bs = inputs.real_images.dim(0)?.min(inputs.fake_images.dim(0)?);
    let real = head(inputs.real_images, bs)?;
    let fake = head(inputs.fake_images, bs)?;
    let real_features = head(inputs.real_features, bs)?;
    let fake_features = head(inputs.fake_features, bs)?;
    let labels = inputs.labels.map(|l| head(l, bs)).transpose()?;

    let alpha = interpolation_weights(&real)?;
    let one_minus = alpha.affine(-1.0, 1.0)?;
    let mixed = (real.broadcast_mul(&one_minus)? + fake.broadcast_mul(&alpha)?)?;
    let x_hat = Var::from_tensor(&mixed.detach())?;

    let layers = inputs
        .discriminator
        .discriminate(x_hat.as_tensor(), bs, labels.as_ref(), UpdateCollection::NoOps)?;
    let d_hat = layers.features()?;
    let witness = (mean_similarity(inputs.kernel, d_hat, &real_features)?
        - mean_similarity(inputs.kernel, d_hat, &fake_features)?)?;

    let grad = input_gradient(&witness.sum_all()?, &x_hat).context("witness gradient")?;
    let penalty = safer_norm(&grad)?.affine(1.0, -1.0)?.sqr()?.mean_all()?;
    Ok(penalty)
}

/// Mean squared activation of every captured layer of both branches.
///
/// Each layer is reduced to a per-example mean, then averaged over its own
/// batch, so the two branches may have different batch sizes.
pub fn l2_activation_penalty(real: &LayerOutputs, fake: &LayerOutputs) -> anyhow::Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (_, layer) in real.iter().chain(fake.iter()) {
        let term = layer.flatten_from(1)?.sqr()?.mean(1)?.mean_all()?;
        total = Some(match total {
            None => term,
            Some(acc) => (acc + term)?,
        });
    }
    total.context("discriminator captured no layers")
}

/// Batch mean of the squared Frobenius norm of `∂output/∂input`, one
/// backward pass per output dimension.
pub fn squared_norm_jacobian(output: &Tensor, input: &Var) -> anyhow::Result<Tensor> {
    let out_dim = output.dim(1)?;
    let mut norm2: Option<Tensor> = None;
    for k in 0..out_dim {
        let column = output.narrow(1, k, 1)?.sum_all()?;
        let grad = input_gradient(&column, input).with_context(|| format!("jacobian column {k}"))?;
        let term = grad.flatten_from(1)?.sqr()?.sum(1)?;
        norm2 = Some(match norm2 {
            None => term,
            Some(acc) => (acc + term)?,
        });
    }
    Ok(norm2.context("discriminator output has no columns")?.mean_all()?)
}

/// Scale factor and its ingredients.
pub struct Scaling {
    pub scale: Tensor,
    pub norm2_jacobian: Tensor,
    pub norm_discriminator: Tensor,
}

/// `1 / (sc · metric + 1)`, with the Jacobian taken on `real_images` (or on
/// N(0, 10²) noise of the same shape when `gaussian_noise` is set).
pub fn scaling_factor(
    variant: ScalingVariant,
    sc: f64,
    discriminator: &dyn Discriminator,
    real_images: &Tensor,
    labels: Option<&Tensor>,
    gaussian_noise: bool,
) -> anyhow::Result<Scaling> {
    let bs = real_images.dim(0)?;
    let data = if gaussian_noise {
        Tensor::randn(0f32, SCALING_NOISE_STD, real_images.shape(), real_images.device())?
            .to_dtype(real_images.dtype())?
    } else {
        real_images.detach()
    };
    let x = Var::from_tensor(&data)?;
    let layers = discriminator.discriminate(x.as_tensor(), bs, labels, UpdateCollection::NoOps)?;
    let features = layers.features()?;

    let norm2_jacobian = squared_norm_jacobian(features, &x)?;
    let norm_discriminator = features.sqr()?.mean_all()?;
    let metric = match variant {
        ScalingVariant::Grad => norm2_jacobian.clone(),
        ScalingVariant::ValueAndGrad => (&norm2_jacobian + &norm_discriminator)?,
    };
    let scale = metric.affine(sc, 1.0)?.recip()?;
    Ok(Scaling {
        scale: scale.to_dtype(DType::F32)?,
        norm2_jacobian,
        norm_discriminator,
    })
}
