//! Failure taxonomy of a training run.
//!
//! Only the failures the driver has to tell apart get a variant here; every
//! other error travels as `anyhow::Error` with context attached.

use std::path::PathBuf;

use thiserror::Error;

/// Which loss went non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Generator,
    Discriminator,
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generator => f.write_str("g_loss"),
            Self::Discriminator => f.write_str("d_loss"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    /// NaN loss. Fatal: the run is aborted and never retried.
    #[error("{annotation} NaN {loss} at step {step}")]
    Divergence {
        step: usize,
        loss: LossKind,
        annotation: String,
    },

    /// Inconsistent configuration, detected before training starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No checkpoint to resume from.
    #[error("no checkpoint found in {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// A tower produced no gradient for a parameter the others did.
    #[error("tower {tower} has no gradient for parameter '{name}'")]
    MissingGradient { name: String, tower: usize },
}

impl TrainError {
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::Divergence { .. })
    }
}
