use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};

use mmd_common::{ScalingVariant, TrainError, TrainingConfig};
use mmd_train::{trainer_from_config, LayerSelection};

#[derive(Parser, Debug)]
#[command(name = "mmdgan", about = "Train MMD-GAN models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train from scratch, or resume from the latest checkpoint of the run.
    Train(TrainArgs),
    /// Restore a checkpoint and export generated samples as .npy files.
    Sample(SampleArgs),
    /// Write a config file with every default filled in.
    InitConfig(InitConfigArgs),
}

// ── Shared overrides ───────────────────────────────────────────────────────────

/// Flags that override fields of the JSON config when given.
#[derive(Parser, Debug, Default)]
struct Overrides {
    /// `synthetic` or a path to an images `.npy` file.
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    kernel: Option<String>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    real_batch_size: Option<usize>,
    #[arg(long)]
    output_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    max_iteration: Option<usize>,
    #[arg(long)]
    dsteps: Option<usize>,
    #[arg(long)]
    gsteps: Option<usize>,
    #[arg(long)]
    start_dsteps: Option<usize>,
    #[arg(long)]
    gradient_penalty: Option<f64>,
    /// Enable the scaled loss with the given variant.
    #[arg(long)]
    scaling: Option<ScalingVariant>,
    #[arg(long)]
    num_replicas: Option<usize>,
    #[arg(long)]
    ckpt_name: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    clip_grad: bool,
    #[arg(long)]
    with_labels: bool,
    #[arg(long)]
    compute_scores: bool,
    #[arg(long)]
    restart_lr: bool,
}

impl Overrides {
    fn apply(self, config: &mut TrainingConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        set!(
            dataset,
            kernel,
            out_dir,
            name,
            batch_size,
            output_size,
            learning_rate,
            max_iteration,
            dsteps,
            gsteps,
            start_dsteps,
            gradient_penalty,
            num_replicas,
            seed
        );
        if self.real_batch_size.is_some() {
            config.real_batch_size = self.real_batch_size;
        }
        if self.ckpt_name.is_some() {
            config.ckpt_name = self.ckpt_name;
        }
        if let Some(variant) = self.scaling {
            config.with_scaling = true;
            config.scaling_variant = variant;
        }
        config.clip_grad |= self.clip_grad;
        config.with_labels |= self.with_labels;
        config.compute_scores |= self.compute_scores;
        config.restart_lr |= self.restart_lr;
    }
}

// ── Train / Sample / InitConfig ────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// JSON config; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
    /// Run on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

#[derive(Parser, Debug)]
struct SampleArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
    #[arg(long, default_value_t = 1024)]
    num_samples: usize,
    /// Also export this many of the last discriminator layers (0 = none, -1 = all).
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    layers: i64,
    #[arg(long)]
    cpu: bool,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    #[command(flatten)]
    overrides: Overrides,
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> Result<TrainingConfig> {
    let mut config = match path {
        Some(p) => TrainingConfig::load(p)?,
        None => TrainingConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Ok(Device::cuda_if_available(0)?)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Sample(args) => cmd_sample(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let config = load_config(args.config.as_ref(), args.overrides)?;
    let device = device(args.cpu)?;
    let mut trainer = trainer_from_config(config, device)?;
    trainer.config().save(&trainer.dirs().log.join("config.json"))?;

    match trainer.train() {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(TrainError::Divergence { step, .. }) = e.downcast_ref::<TrainError>() {
                tracing::error!(step, "training diverged");
            }
            Err(e)
        }
    }
}

fn cmd_sample(args: SampleArgs) -> Result<()> {
    let config = load_config(args.config.as_ref(), args.overrides)?;
    let device = device(args.cpu)?;
    let mut trainer = trainer_from_config(config, device)?;
    let meta = trainer.restore()?;
    tracing::info!(step = meta.global_step, "checkpoint restored");

    let layers = match args.layers {
        0 => LayerSelection::None,
        n if n < 0 => LayerSelection::All,
        n => LayerSelection::Last(n as usize),
    };
    let paths = trainer.export_samples(args.num_samples, layers)?;
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    let config = load_config(None, args.overrides)?;
    config.save(&args.output)?;
    println!("wrote {}", args.output.display());
    Ok(())
}
