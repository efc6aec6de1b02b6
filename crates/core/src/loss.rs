//! Composite MMD loss.
//!
//! `g_loss = MMD²(fake, real)` and `d_loss = −g_loss`, optionally rescaled by
//! the Jacobian-norm factor and then extended with the gradient penalty and
//! the L2 activation penalty on the discriminator side.

use candle_core::Tensor;

use mmd_common::{ScalingVariant, TrainError, TrainingConfig};

use crate::kernel::{kernel_by_name, mmd2_between, scalar_f32, Kernel, KERNEL_NAMES};
use crate::networks::{Discriminator, LayerOutputs};
use crate::penalty::{gradient_penalty, l2_activation_penalty, scaling_factor, PenaltyInputs};

/// Everything one tower feeds into the loss.
pub struct LossInputs<'a> {
    pub discriminator: &'a dyn Discriminator,
    pub real_images: &'a Tensor,
    pub fake_images: &'a Tensor,
    pub real_layers: &'a LayerOutputs,
    pub fake_layers: &'a LayerOutputs,
    pub labels: Option<&'a Tensor>,
}

/// Decayable regulariser coefficients at the current step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub gp: f64,
    pub sc: f64,
}

/// Scalar side products of a loss evaluation, for telemetry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossDiagnostics {
    pub mmd2: f32,
    pub gradient_penalty: Option<f32>,
    pub l2_penalty: Option<f32>,
    pub unscaled_g_loss: Option<f32>,
    pub norm2_jacobian: Option<f32>,
    pub norm_discriminator: Option<f32>,
}

pub struct ComposedLoss {
    pub g_loss: Tensor,
    pub d_loss: Tensor,
    pub diagnostics: LossDiagnostics,
}

pub struct LossComposer {
    kernel: Box<dyn Kernel>,
    gradient_penalty: bool,
    l2_coefficient: f64,
    scaling: Option<ScalingVariant>,
    gaussian_noise: bool,
    description: String,
}

impl LossComposer {
    /// Resolve the kernel and the active terms. Unknown kernels are rejected.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainError> {
        let kernel = kernel_by_name(&config.kernel).ok_or_else(|| {
            TrainError::Config(format!(
                "unknown kernel '{}', expected one of {}",
                config.kernel,
                KERNEL_NAMES.join(", ")
            ))
        })?;

        let mut description = String::from("kernel_loss");
        if config.gradient_penalty > 0.0 {
            description.push_str(&format!("_(gp {:.1})", config.gradient_penalty));
        }
        if config.l2_discriminator_penalty > 0.0 {
            description.push_str(&format!(" (L2 dp {:.6})", config.l2_discriminator_penalty));
        }
        if config.with_scaling {
            description.push_str(&format!(" (scaled {})", config.scaling_variant.as_str()));
        }
        let description = description.replace(") (", ", ");

        tracing::info!(kernel = kernel.name(), loss = %description, "loss set");
        Ok(Self {
            kernel,
            gradient_penalty: config.gradient_penalty > 0.0,
            l2_coefficient: config.l2_discriminator_penalty,
            scaling: config.with_scaling.then_some(config.scaling_variant),
            gaussian_noise: config.use_gaussian_noise,
            description,
        })
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    /// Human-readable summary of the active terms.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn compose(&self, inputs: &LossInputs<'_>, coeffs: Coefficients) -> anyhow::Result<ComposedLoss> {
        let real_features = inputs.real_layers.features()?;
        let fake_features = inputs.fake_layers.features()?;

        let mmd2 = mmd2_between(self.kernel(), fake_features, real_features)?;
        let mut diagnostics = LossDiagnostics {
            mmd2: scalar_f32(&mmd2)?,
            ..Default::default()
        };
        let mut g_loss = mmd2;

        if let Some(variant) = self.scaling {
            let s = scaling_factor(
                variant,
                coeffs.sc,
                inputs.discriminator,
                inputs.real_images,
                inputs.labels,
                self.gaussian_noise,
            )?;
            diagnostics.unscaled_g_loss = Some(diagnostics.mmd2);
            diagnostics.norm2_jacobian = Some(scalar_f32(&s.norm2_jacobian)?);
            diagnostics.norm_discriminator = Some(scalar_f32(&s.norm_discriminator)?);
            g_loss = (g_loss * s.scale)?;
        }
        let mut d_loss = g_loss.neg()?;

        if self.gradient_penalty {
            let penalty = gradient_penalty(&PenaltyInputs {
                kernel: self.kernel(),
                discriminator: inputs.discriminator,
                real_images: inputs.real_images,
                fake_images: inputs.fake_images,
                real_features,
                fake_features,
                labels: inputs.labels,
            })?;
            diagnostics.gradient_penalty = Some(scalar_f32(&penalty)?);
            d_loss = (d_loss + penalty.affine(coeffs.gp, 0.0)?)?;
        }

        if self.l2_coefficient > 0.0 {
            let penalty = l2_activation_penalty(inputs.real_layers, inputs.fake_layers)?
                .affine(self.l2_coefficient, 0.0)?;
            diagnostics.l2_penalty = Some(scalar_f32(&penalty)?);
            d_loss = (d_loss + penalty)?;
        }

        Ok(ComposedLoss {
            g_loss,
            d_loss,
            diagnostics,
        })
    }
}
