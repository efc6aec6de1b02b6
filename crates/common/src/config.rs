//! Training configuration for MMD-GAN runs.
//!
//! Serialised as JSON. Every field has a serde default so a minimal `{}` file
//! produces a runnable (if small) configuration. Call
//! [`TrainingConfig::validate`] before building anything from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Regularised variant of the scaled MMD loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingVariant {
    /// `scale = 1 / (sc · ‖J‖² + 1)`
    Grad,
    /// `scale = 1 / (sc · (‖J‖² + mean D(x)²) + 1)`
    ValueAndGrad,
}

impl ScalingVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grad => "grad",
            Self::ValueAndGrad => "value_and_grad",
        }
    }
}

impl std::str::FromStr for ScalingVariant {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grad" => Ok(Self::Grad),
            "value_and_grad" => Ok(Self::ValueAndGrad),
            other => Err(TrainError::Config(format!("unknown scaling variant '{other}'"))),
        }
    }
}

/// Immutable snapshot of every training knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // ── Identity ────────────────────────────────────────────────────────────
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Kernel used by the MMD statistic (`dot`, `poly`, `mix_rbf`, `mix_rq`, `distance`).
    #[serde(default = "default_kernel")]
    pub kernel: String,
    /// Model family tag, only used in the run description.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub suffix: String,

    // ── Shapes ──────────────────────────────────────────────────────────────
    /// Generated batch size per replica.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Real batch size per replica; `None` means "same as `batch_size`".
    #[serde(default)]
    pub real_batch_size: Option<usize>,
    #[serde(default = "default_output_size")]
    pub output_size: usize,
    /// Image channels (1 = grayscale).
    #[serde(default = "default_c_dim")]
    pub c_dim: usize,
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,
    /// Generator width multiplier.
    #[serde(default = "default_width")]
    pub gf_dim: usize,
    /// Discriminator width multiplier.
    #[serde(default = "default_width")]
    pub df_dim: usize,
    /// Dimension of the discriminator's final feature embedding.
    #[serde(default = "default_dof_dim")]
    pub dof_dim: usize,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub with_labels: bool,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    // ── Optimisation ────────────────────────────────────────────────────────
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Discriminator learning rate; `None` falls back to `learning_rate`.
    #[serde(default)]
    pub learning_rate_d: Option<f64>,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Apply the decay ops every N generator steps (0 = only on demand).
    #[serde(default)]
    pub lr_decay_every: usize,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default)]
    pub clip_grad: bool,
    #[serde(default = "default_max_iteration")]
    pub max_iteration: usize,
    #[serde(default)]
    pub restart_lr: bool,
    #[serde(default)]
    pub restart_sc: bool,

    // ── Step cadence ────────────────────────────────────────────────────────
    #[serde(default = "default_dsteps")]
    pub dsteps: usize,
    #[serde(default = "default_gsteps")]
    pub gsteps: usize,
    /// Discriminator steps per cycle during warm-up (step < 20 or step % 500 == 0).
    #[serde(default = "default_start_dsteps")]
    pub start_dsteps: usize,

    // ── Regularisers ────────────────────────────────────────────────────────
    /// Gradient-penalty coefficient (0 = disabled).
    #[serde(default)]
    pub gradient_penalty: f64,
    #[serde(default = "default_one")]
    pub gp_decay_rate: f64,
    #[serde(default)]
    pub with_scaling: bool,
    #[serde(default = "default_one")]
    pub scaling_coeff: f64,
    #[serde(default = "default_one")]
    pub sc_decay_rate: f64,
    #[serde(default = "default_scaling_variant")]
    pub scaling_variant: ScalingVariant,
    /// Evaluate the scaling Jacobian on N(0, 10²) noise instead of the real batch.
    #[serde(default)]
    pub use_gaussian_noise: bool,
    #[serde(default)]
    pub l2_discriminator_penalty: f64,

    // ── Replicas & persistence ──────────────────────────────────────────────
    #[serde(default = "default_num_replicas")]
    pub num_replicas: usize,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default)]
    pub compute_scores: bool,
    /// Layer-output dump multiplier (0 = disabled, 1 = linear schedule only).
    #[serde(default)]
    pub save_layer_outputs: f64,
    /// Restore this checkpoint instead of the latest one.
    #[serde(default)]
    pub ckpt_name: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,

    // ── Paths ───────────────────────────────────────────────────────────────
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_sample_dir")]
    pub sample_dir: String,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_dataset() -> String {
    "synthetic".into()
}
fn default_architecture() -> String {
    "mlp".into()
}
fn default_kernel() -> String {
    "mix_rq".into()
}
fn default_model() -> String {
    "mmd".into()
}
fn default_batch_size() -> usize {
    64
}
fn default_output_size() -> usize {
    16
}
fn default_c_dim() -> usize {
    1
}
fn default_z_dim() -> usize {
    32
}
fn default_width() -> usize {
    64
}
fn default_dof_dim() -> usize {
    16
}
fn default_num_classes() -> usize {
    10
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_decay_rate() -> f64 {
    0.8
}
fn default_beta1() -> f64 {
    0.5
}
fn default_beta2() -> f64 {
    0.9
}
fn default_max_iteration() -> usize {
    150_000
}
fn default_dsteps() -> usize {
    5
}
fn default_gsteps() -> usize {
    1
}
fn default_start_dsteps() -> usize {
    10
}
fn default_one() -> f64 {
    1.0
}
fn default_scaling_variant() -> ScalingVariant {
    ScalingVariant::Grad
}
fn default_num_replicas() -> usize {
    1
}
fn default_max_to_keep() -> usize {
    5
}
fn default_seed() -> u64 {
    0
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_checkpoint_dir() -> String {
    "checkpoint".into()
}
fn default_log_dir() -> String {
    "log".into()
}
fn default_sample_dir() -> String {
    "sample".into()
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for TrainingConfig {
    fn default() -> Self {
        // Serde defaults are the single source of truth.
        serde_json::from_str("{}").expect("empty config deserialises")
    }
}

impl TrainingConfig {
    /// Real batch size with the `None → batch_size` fallback applied.
    pub fn real_batch_size(&self) -> usize {
        self.real_batch_size.unwrap_or(self.batch_size)
    }

    /// Discriminator learning rate with the `None → learning_rate` fallback applied.
    pub fn learning_rate_d(&self) -> f64 {
        self.learning_rate_d.unwrap_or(self.learning_rate)
    }

    /// Flattened size of one sample (`c_dim · output_size²`).
    pub fn input_dim(&self) -> usize {
        self.c_dim * self.output_size * self.output_size
    }

    /// Whether the loss needs gradients of gradients.
    pub fn needs_second_order(&self) -> bool {
        self.gradient_penalty > 0.0 || self.with_scaling
    }

    /// Run description used to name output directories, e.g.
    /// `synthetic64x64_mlp_dc_mmd-mix_rqd5-10-1_64_16_lr0.00010000`.
    pub fn description(&self) -> String {
        let lr = if self.learning_rate_d() == self.learning_rate {
            format!("lr{:.8}", self.learning_rate)
        } else {
            format!("lr{:.8}G{:.6}D", self.learning_rate, self.learning_rate_d())
        };
        let mut desc = format!(
            "{}{}x{}_{}_dc_{}-{}d{}-{}-{}_{}_{}_{}",
            self.dataset,
            self.gf_dim,
            self.df_dim,
            self.architecture,
            self.model,
            self.kernel,
            self.dsteps,
            self.start_dsteps,
            self.gsteps,
            self.batch_size,
            self.output_size,
            lr,
        );
        if self.dof_dim > 1 {
            desc.push_str(&format!("_dof{}", self.dof_dim));
        }
        if self.batch_norm {
            desc.push_str("_bn");
        }
        desc
    }

    /// Reject inconsistent configurations before any training state is built.
    pub fn validate(&self) -> Result<(), TrainError> {
        let fail = |msg: String| Err(TrainError::Config(msg));
        if self.batch_size == 0 || self.real_batch_size() == 0 {
            return fail("batch sizes must be positive".into());
        }
        if self.num_replicas == 0 {
            return fail("num_replicas must be at least 1".into());
        }
        if self.gsteps == 0 {
            return fail("gsteps must be at least 1".into());
        }
        if self.max_to_keep == 0 {
            return fail("max_to_keep must be at least 1".into());
        }
        if self.learning_rate <= 0.0 || self.learning_rate_d() <= 0.0 {
            return fail("learning rates must be positive".into());
        }
        if !(self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return fail(format!("decay_rate must be in (0, 1], got {}", self.decay_rate));
        }
        if self.gradient_penalty < 0.0 || self.l2_discriminator_penalty < 0.0 {
            return fail("penalty coefficients must be non-negative".into());
        }
        if self.gradient_penalty > 0.0 && self.with_scaling {
            return fail("gradient_penalty and with_scaling are mutually exclusive".into());
        }
        if self.with_labels && self.num_classes == 0 {
            return fail("with_labels requires num_classes > 0".into());
        }
        if self.output_size == 0 || self.c_dim == 0 || self.z_dim == 0 || self.dof_dim == 0 {
            return fail("output_size, c_dim, z_dim and dof_dim must be positive".into());
        }
        if self.save_layer_outputs < 0.0 {
            return fail("save_layer_outputs must be non-negative".into());
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Run directories ─────────────────────────────────────────────────────────

/// Output directories of one run, one field per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirs {
    pub checkpoint: PathBuf,
    pub log: PathBuf,
    pub sample: PathBuf,
}

impl RunDirs {
    /// Resolve `out_dir/<role>/<name>/<suffix><description>` for every role.
    ///
    /// An empty role name is a configuration error.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainError> {
        let leaf = format!("{}{}", config.suffix, config.description());
        let resolve = |role: &str, value: &str| -> Result<PathBuf, TrainError> {
            if value.trim().is_empty() {
                return Err(TrainError::Config(format!("{role} directory is empty")));
            }
            let mut path = config.out_dir.join(value);
            if !config.name.is_empty() {
                path = path.join(&config.name);
            }
            Ok(path.join(&leaf))
        };
        Ok(Self {
            checkpoint: resolve("checkpoint", &config.checkpoint_dir)?,
            log: resolve("log", &config.log_dir)?,
            sample: resolve("sample", &config.sample_dir)?,
        })
    }

    /// Create every directory that does not exist yet.
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.checkpoint, &self.log, &self.sample] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config: TrainingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.real_batch_size(), 64);
        assert_eq!(config.max_to_keep, 5);
        assert_eq!(config.scaling_variant, ScalingVariant::Grad);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn discriminator_lr_defaults_to_shared() {
        let mut config = TrainingConfig::default();
        config.learning_rate = 3e-4;
        assert_eq!(config.learning_rate_d(), 3e-4);
        config.learning_rate_d = Some(1e-4);
        assert_eq!(config.learning_rate_d(), 1e-4);
    }

    #[test]
    fn config_json_round_trip() {
        let config = TrainingConfig {
            kernel: "mix_rbf".into(),
            real_batch_size: Some(32),
            scaling_variant: ScalingVariant::ValueAndGrad,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"value_and_grad\""));
        let loaded: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.kernel, "mix_rbf");
        assert_eq!(loaded.real_batch_size(), 32);
        assert_eq!(loaded.scaling_variant, ScalingVariant::ValueAndGrad);
    }

    #[test]
    fn gradient_penalty_and_scaling_are_exclusive() {
        let config = TrainingConfig {
            gradient_penalty: 1.0,
            with_scaling: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));
    }

    #[test]
    fn zero_gsteps_rejected() {
        let config = TrainingConfig {
            gsteps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn description_marks_split_learning_rates() {
        let mut config = TrainingConfig::default();
        assert!(config.description().ends_with("lr0.00010000_dof16"));
        config.learning_rate_d = Some(5e-5);
        assert!(config.description().contains("G0.000050D"));
    }

    #[test]
    fn run_dirs_follow_roles() {
        let config = TrainingConfig {
            out_dir: PathBuf::from("/tmp/out"),
            name: "exp".into(),
            suffix: "a_".into(),
            ..Default::default()
        };
        let dirs = RunDirs::from_config(&config).unwrap();
        let leaf = format!("a_{}", config.description());
        assert_eq!(dirs.checkpoint, PathBuf::from("/tmp/out/checkpoint/exp").join(&leaf));
        assert_eq!(dirs.sample, PathBuf::from("/tmp/out/sample/exp").join(&leaf));
    }

    #[test]
    fn empty_dir_role_is_config_error() {
        let config = TrainingConfig {
            log_dir: String::new(),
            ..Default::default()
        };
        assert!(matches!(RunDirs::from_config(&config), Err(TrainError::Config(_))));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig {
            dsteps: 3,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.dsteps, 3);
    }
}
