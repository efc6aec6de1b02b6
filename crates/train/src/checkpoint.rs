//! Checkpoint persistence with bounded retention.
//!
//! A checkpoint is two files next to each other:
//!
//! * `MMDGAN.model-{step}.safetensors`: every variable of the canonical
//!   `VarMap` (trainable parameters and running statistics),
//! * `MMDGAN.model-{step}.json`: step counters and the decayable
//!   hyper-parameters ([`CheckpointMeta`]).
//!
//! A `checkpoint` index file in the same directory lists the retained
//! checkpoints, oldest first.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use mmd_common::TrainError;

use crate::optim::HyperState;

pub const CHECKPOINT_PREFIX: &str = "MMDGAN.model";
const INDEX_FILE: &str = "checkpoint";

/// Counters and hyper-parameters saved alongside the weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub global_step: usize,
    pub global_d_step: usize,
    pub hyper: HyperState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    /// Retained checkpoint names, oldest first.
    checkpoints: Vec<String>,
}

pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name_for(step: usize) -> String {
        format!("{CHECKPOINT_PREFIX}-{step}")
    }

    fn weights_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.safetensors"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_index(&self) -> anyhow::Result<CheckpointIndex> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(CheckpointIndex::default());
        }
        let json = std::fs::read_to_string(&path)?;
        serde_json::from_str(&json).with_context(|| format!("corrupt index {}", path.display()))
    }

    fn write_index(&self, index: &CheckpointIndex) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(index)?;
        std::fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(())
    }

    /// Retained checkpoint names, oldest first.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.read_index()?.checkpoints)
    }

    pub fn latest(&self) -> anyhow::Result<Option<String>> {
        Ok(self.read_index()?.checkpoints.last().cloned())
    }

    /// Write the checkpoint of `step` and evict the oldest ones beyond
    /// `max_to_keep`.
    pub fn save(&self, varmap: &VarMap, step: usize, meta: &CheckpointMeta) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = Self::name_for(step);
        let weights = self.weights_path(&name);
        varmap
            .save(&weights)
            .with_context(|| format!("saving {}", weights.display()))?;
        std::fs::write(self.meta_path(&name), serde_json::to_string_pretty(meta)?)?;

        let mut index = self.read_index()?;
        index.checkpoints.retain(|n| n != &name);
        index.checkpoints.push(name);
        while index.checkpoints.len() > self.max_to_keep {
            let evicted = index.checkpoints.remove(0);
            for path in [self.weights_path(&evicted), self.meta_path(&evicted)] {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "could not evict checkpoint");
                }
            }
            tracing::debug!(checkpoint = %evicted, "evicted");
        }
        self.write_index(&index)?;
        tracing::info!(path = %weights.display(), step, "checkpoint saved");
        Ok(weights)
    }

    /// Restore `name` (or the latest retained checkpoint) into `varmap`.
    ///
    /// Fails with [`TrainError::CheckpointNotFound`] when there is nothing to
    /// restore. The metadata and every weight are read and checked before
    /// any variable is written, so a failed load leaves `varmap` untouched.
    pub fn load(&self, varmap: &VarMap, name: Option<&str>) -> anyhow::Result<CheckpointMeta> {
        let name = match name {
            Some(n) => n.trim_end_matches(".safetensors").to_string(),
            None => self
                .latest()?
                .ok_or_else(|| TrainError::CheckpointNotFound(self.dir.clone()))?,
        };
        let weights = self.weights_path(&name);
        if !weights.exists() {
            return Err(TrainError::CheckpointNotFound(weights).into());
        }
        let meta_json = std::fs::read_to_string(self.meta_path(&name))
            .with_context(|| format!("reading metadata of {name}"))?;
        let meta: CheckpointMeta = serde_json::from_str(&meta_json)
            .with_context(|| format!("corrupt metadata of {name}"))?;

        let mut stored = candle_core::safetensors::load(&weights, &Device::Cpu)
            .with_context(|| format!("loading {}", weights.display()))?;
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
        let mut staged = Vec::with_capacity(vars.len());
        for (var_name, var) in vars.iter() {
            let value = stored
                .remove(var_name)
                .with_context(|| format!("{name} has no variable '{var_name}'"))?;
            if value.shape() != var.shape() {
                anyhow::bail!(
                    "{name}: '{var_name}' has shape {:?}, expected {:?}",
                    value.shape(),
                    var.shape()
                );
            }
            staged.push((var, value.to_device(var.device())?.to_dtype(var.dtype())?));
        }
        for (var, value) in staged {
            var.set(&value)?;
        }
        Ok(meta)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
