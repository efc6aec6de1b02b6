//! Trainer: the MMD-GAN training loop driver.
//!
//! One [`Trainer::train_step`] call:
//!
//! 1. reads the global step and advances the step scheduler,
//! 2. pulls one real shard per replica and runs the towers in parallel,
//! 3. aborts with [`TrainError::Divergence`] if either mean loss is NaN,
//!    before anything is written,
//! 4. averages the gradients of the scheduled group and applies exactly one
//!    optimizer update, then writes the averaged running statistics,
//! 5. on generator steps, emits the summary, runs the checkpoint / sample /
//!    layer-dump cadence and consults the scorer.

use std::sync::Arc;

use anyhow::Context;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mmd_common::{pipeline_from_config, InputPipeline, LossKind, RunDirs, TrainError, TrainingConfig};
use mmd_core::{
    autograd, build_networks, Coefficients, Discriminator, Generator, Group, LossComposer,
    LossDiagnostics, ParameterGroups, UpdateCollection,
};

use crate::aggregate::{average_gradients, average_stat_updates, CLIP_NORM};
use crate::cadence::{
    should_checkpoint, should_sample, LayerDumpSchedule, LAYER_DUMP_LAST, LAYER_DUMP_ROWS,
};
use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::optim::{HyperState, OptimizerBank};
use crate::sample::{sample_grid_path, save_image_grid, save_npy_each, save_npz, GRID_SIDE};
use crate::scheduler::{advance, should_emit_summary, Cadence, SchedulerState, StepKind};
use crate::scorer::{MmdScorer, ScoreContext, Scorer};
use crate::telemetry::{JsonlSummaryWriter, SummaryRecord, SummarySink};
use crate::timer::ProgressTimer;
use crate::tower::{run_towers, TowerInput, TowerShared};

// ── Collaborators ───────────────────────────────────────────────────────────

/// Pluggable strategies the driver consumes.
pub struct Collaborators {
    pub pipeline: Box<dyn InputPipeline>,
    pub summaries: Box<dyn SummarySink>,
    pub scorer: Option<Arc<dyn Scorer>>,
}

impl Collaborators {
    /// Pipeline named by `config.dataset`, JSONL summaries in the log
    /// directory, and an [`MmdScorer`] when `compute_scores` is set.
    pub fn from_config(config: &TrainingConfig, dirs: &RunDirs) -> anyhow::Result<Self> {
        let scorer: Option<Arc<dyn Scorer>> = if config.compute_scores {
            Some(Arc::new(MmdScorer::default()))
        } else {
            None
        };
        Ok(Self {
            pipeline: pipeline_from_config(config)?,
            summaries: Box::new(JsonlSummaryWriter::create(&dirs.log)?),
            scorer,
        })
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Every piece of mutable training state, built once per run.
pub struct TrainingContext {
    pub varmap: VarMap,
    pub groups: ParameterGroups,
    pub optimizers: OptimizerBank,
    pub scheduler: SchedulerState,
    /// Generator updates so far.
    pub global_step: usize,
    /// Discriminator updates so far.
    pub global_d_step: usize,
    pub hyper: HyperState,
}

/// Result of one [`Trainer::train_step`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Global step read at the start of the step.
    pub step: usize,
    pub kind: StepKind,
    pub g_loss: f32,
    pub d_loss: f32,
    pub diagnostics: LossDiagnostics,
    /// The scorer asked for the decay ops to run.
    pub decay_requested: bool,
}

/// Which discriminator layers [`Trainer::export_samples`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSelection {
    None,
    /// The last `n` layers in sorted order.
    Last(usize),
    All,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    config: TrainingConfig,
    dirs: RunDirs,
    device: Device,
    ctx: TrainingContext,
    generator: Box<dyn Generator>,
    discriminator: Box<dyn Discriminator>,
    composer: LossComposer,
    cadence: Cadence,
    layer_dumps: LayerDumpSchedule,
    checkpoints: CheckpointManager,
    timer: ProgressTimer,
    collaborators: Collaborators,
    rng: StdRng,
    /// Frozen latents rendered into every sample grid.
    sample_z: Tensor,
    sample_y: Option<Tensor>,
}

impl Trainer {
    /// Validate the configuration and build the full training context.
    pub fn new(
        config: TrainingConfig,
        dirs: RunDirs,
        device: Device,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let (generator, discriminator) = build_networks(&config, &varmap, &device)?;
        Self::assemble(config, dirs, device, collaborators, varmap, generator, discriminator)
    }

    /// Like [`Trainer::new`], around networks whose variables already live
    /// in `varmap`.
    pub fn with_networks(
        config: TrainingConfig,
        dirs: RunDirs,
        device: Device,
        collaborators: Collaborators,
        varmap: VarMap,
        generator: Box<dyn Generator>,
        discriminator: Box<dyn Discriminator>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Self::assemble(config, dirs, device, collaborators, varmap, generator, discriminator)
    }

    fn assemble(
        config: TrainingConfig,
        dirs: RunDirs,
        device: Device,
        collaborators: Collaborators,
        varmap: VarMap,
        generator: Box<dyn Generator>,
        discriminator: Box<dyn Discriminator>,
    ) -> anyhow::Result<Self> {
        if config.needs_second_order() {
            autograd::enable_second_order();
        }
        let composer = LossComposer::from_config(&config)?;
        let cadence = Cadence::from_config(&config)?;

        let groups = ParameterGroups::partition(&varmap)?;
        let hyper = HyperState::from_config(&config);
        let optimizers = OptimizerBank::new(&config, &groups, hyper.lr)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let sample_rows = GRID_SIDE * GRID_SIDE;
        let sample_z = uniform_latents(&mut rng, sample_rows, config.z_dim, &device)?;
        let sample_y = if config.with_labels {
            Some(random_labels(&mut rng, sample_rows, config.num_classes, &device)?)
        } else {
            None
        };

        let timer = ProgressTimer::with_transcript(&dirs.log)?;
        tracing::info!(
            description = %config.description(),
            loss = composer.description(),
            replicas = config.num_replicas,
            checkpoint_dir = %dirs.checkpoint.display(),
            "model built"
        );

        Ok(Self {
            layer_dumps: LayerDumpSchedule::new(config.save_layer_outputs, config.max_iteration),
            checkpoints: CheckpointManager::new(&dirs.checkpoint, config.max_to_keep),
            ctx: TrainingContext {
                varmap,
                groups,
                optimizers,
                scheduler: SchedulerState::default(),
                global_step: 0,
                global_d_step: 0,
                hyper,
            },
            config,
            dirs,
            device,
            generator,
            discriminator,
            composer,
            cadence,
            timer,
            collaborators,
            rng,
            sample_z,
            sample_y,
        })
    }

    pub fn context(&self) -> &TrainingContext {
        &self.ctx
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn dirs(&self) -> &RunDirs {
        &self.dirs
    }

    // ── Checkpoints ─────────────────────────────────────────────────────────

    /// Load `ckpt_name` (or the latest checkpoint) and restore counters and
    /// hyper-parameters. Fails with [`TrainError::CheckpointNotFound`].
    pub fn restore(&mut self) -> anyhow::Result<CheckpointMeta> {
        let meta = self
            .checkpoints
            .load(&self.ctx.varmap, self.config.ckpt_name.as_deref())?;
        self.ctx.global_step = meta.global_step;
        self.ctx.global_d_step = meta.global_d_step;
        self.ctx.hyper = meta.hyper;
        self.ctx.optimizers.set_learning_rate(meta.hyper.lr);
        Ok(meta)
    }

    pub fn save_checkpoint(&self, step: usize) -> anyhow::Result<()> {
        let meta = CheckpointMeta {
            global_step: self.ctx.global_step,
            global_d_step: self.ctx.global_d_step,
            hyper: self.ctx.hyper,
        };
        self.checkpoints.save(&self.ctx.varmap, step, &meta)?;
        Ok(())
    }

    /// Resume from the latest checkpoint or cold-start, then apply the
    /// learning-rate and scaling restarts. Returns the starting step.
    pub fn train_init(&mut self) -> anyhow::Result<usize> {
        self.ctx.scheduler = SchedulerState::default();
        let mut restart_lr = self.config.restart_lr;
        match self.restore() {
            Ok(meta) => tracing::info!(
                step = meta.global_step,
                lr = meta.hyper.lr,
                "checkpoint loaded, resuming"
            ),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint load failed, cold start");
                restart_lr = true;
            }
        }
        if restart_lr {
            self.ctx.hyper.lr = self.config.learning_rate;
        }
        if self.config.with_scaling && self.config.restart_sc {
            self.ctx.hyper.sc = self.config.scaling_coeff;
        }
        self.ctx.optimizers.set_learning_rate(self.ctx.hyper.lr);
        tracing::info!(lr = self.ctx.hyper.lr, sc = self.ctx.hyper.sc, "model initialized for training");
        Ok(self.ctx.global_step)
    }

    // ── Decay ───────────────────────────────────────────────────────────────

    pub fn decay_lr(&mut self) {
        self.ctx.hyper.decay_lr(self.config.decay_rate);
        self.ctx.optimizers.set_learning_rate(self.ctx.hyper.lr);
    }

    pub fn decay_gp(&mut self) {
        self.ctx.hyper.decay_gp(self.config.gp_decay_rate);
    }

    pub fn decay_sc(&mut self) {
        self.ctx.hyper.decay_sc(self.config.sc_decay_rate);
    }

    /// Decay the learning rate and every active regulariser coefficient.
    pub fn decay_ops(&mut self) {
        self.decay_lr();
        if self.config.gradient_penalty > 0.0 {
            self.decay_gp();
        }
        if self.config.with_scaling {
            self.decay_sc();
        }
        tracing::info!(
            lr = self.ctx.hyper.lr,
            gp = self.ctx.hyper.gp,
            sc = self.ctx.hyper.sc,
            "decayed"
        );
    }

    // ── Step ────────────────────────────────────────────────────────────────

    pub fn train_step(&mut self) -> anyhow::Result<StepOutcome> {
        let step = self.ctx.global_step;
        let (state, kind) = advance(self.ctx.scheduler, step, &self.cadence);
        self.ctx.scheduler = state;
        let write_summary = should_emit_summary(step, state.err_counter);

        let mut inputs = Vec::with_capacity(self.config.num_replicas);
        for _ in 0..self.config.num_replicas {
            let shard = self.collaborators.pipeline.connect().context("input pipeline")?;
            let z = uniform_latents(&mut self.rng, self.config.batch_size, self.config.z_dim, &self.device)?;
            let labels = self.generator_labels(self.config.batch_size)?;
            inputs.push(TowerInput { shard, z, labels });
        }

        let shared = TowerShared {
            generator: self.generator.as_ref(),
            discriminator: self.discriminator.as_ref(),
            composer: &self.composer,
            groups: &self.ctx.groups,
            device: &self.device,
            coeffs: Coefficients {
                gp: self.ctx.hyper.gp,
                sc: self.ctx.hyper.sc,
            },
            clip: self.config.clip_grad.then_some(CLIP_NORM),
        };
        let outputs = run_towers(&shared, inputs)?;

        let n = outputs.len() as f32;
        let g_loss = outputs.iter().map(|o| o.g_loss).sum::<f32>() / n;
        let d_loss = outputs.iter().map(|o| o.d_loss).sum::<f32>() / n;
        let diagnostics = outputs[0].diagnostics.clone();
        let annotation = self
            .timer
            .annotate(step, if kind.is_generator() { "g step" } else { "d step" })
            .to_string();

        for (loss, value) in [(LossKind::Generator, g_loss), (LossKind::Discriminator, d_loss)] {
            if value.is_nan() {
                return Err(TrainError::Divergence {
                    step,
                    loss,
                    annotation,
                }
                .into());
            }
        }

        let mut g_stores = Vec::with_capacity(outputs.len());
        let mut d_stores = Vec::with_capacity(outputs.len());
        let mut updates = Vec::with_capacity(outputs.len());
        for out in outputs {
            g_stores.push(out.g_grads);
            d_stores.push(out.d_grads);
            updates.push(out.updates);
        }
        let group = match kind {
            StepKind::Generator => Group::Generator,
            StepKind::Discriminator => Group::Discriminator,
        };
        let stores = match group {
            Group::Generator => g_stores,
            Group::Discriminator => d_stores,
        };
        let grads = average_gradients(stores, self.ctx.groups.get(group))?;
        self.ctx.optimizers.apply(group, &grads)?;
        match kind {
            StepKind::Generator => self.ctx.global_step += 1,
            StepKind::Discriminator => self.ctx.global_d_step += 1,
        }
        for update in average_stat_updates(updates)? {
            update.var.set(&update.value.detach())?;
        }

        let mut decay_requested = false;
        if kind.is_generator() {
            if write_summary {
                self.emit_summary(step, g_loss, d_loss, &diagnostics);
            }
            self.run_cadence(step, kind);
            decay_requested = self.score(step);
        }

        Ok(StepOutcome {
            step,
            kind,
            g_loss,
            d_loss,
            diagnostics,
            decay_requested,
        })
    }

    /// Run until the global step exceeds `max_iteration`.
    pub fn train(&mut self) -> anyhow::Result<()> {
        self.train_init()?;
        self.collaborators.pipeline.start()?;
        let result = self.run_loop();
        self.collaborators.pipeline.stop();
        result
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        let every = self.config.lr_decay_every;
        while self.ctx.global_step <= self.config.max_iteration {
            let out = self.train_step()?;
            let scheduled = every > 0 && self.ctx.global_step % every == 0;
            if out.kind.is_generator() && (scheduled || out.decay_requested) {
                self.decay_ops();
            }
        }
        tracing::info!(
            steps = self.ctx.global_step,
            d_steps = self.ctx.global_d_step,
            "training finished"
        );
        Ok(())
    }

    // ── Side effects ────────────────────────────────────────────────────────

    fn emit_summary(&mut self, step: usize, g_loss: f32, d_loss: f32, diagnostics: &LossDiagnostics) {
        let record = SummaryRecord::new(
            step,
            self.ctx.global_d_step,
            (g_loss, d_loss),
            &self.ctx.hyper,
            diagnostics,
        );
        let line = format!(
            "{}, G: {:.8}, D: {:.8}",
            self.composer.description(),
            g_loss,
            d_loss
        );
        let written = self
            .timer
            .report(step, &line)
            .and_then(|_| self.collaborators.summaries.write(&record));
        match written {
            Ok(()) => self.ctx.scheduler.record_summary_success(),
            Err(e) => {
                self.ctx.scheduler.record_summary_failure();
                tracing::warn!(
                    step,
                    error = %e,
                    err_counter = self.ctx.scheduler.err_counter,
                    "summary failed"
                );
            }
        }
    }

    /// Checkpoint, sample grid and layer dump for a generator step.
    ///
    /// Each side effect fails on its own: the error is logged and training
    /// goes on.
    pub fn run_cadence(&mut self, step: usize, kind: StepKind) {
        if should_checkpoint(step, kind) {
            if let Err(e) = self.save_checkpoint(step) {
                tracing::warn!(step, error = %e, "checkpoint failed");
            }
        }
        if should_sample(step, kind) {
            if let Err(e) = self.save_sample_grid(step) {
                tracing::warn!(step, error = %e, "sample grid failed");
            }
        }
        if self.layer_dumps.should_dump(step, kind) {
            if let Err(e) = self.save_layers(step) {
                tracing::warn!(step, error = %e, "layer dump failed");
            }
        }
    }

    fn save_sample_grid(&self, step: usize) -> anyhow::Result<()> {
        let samples = self.render_frozen_samples()?;
        let path = sample_grid_path(&self.dirs.sample, step);
        save_image_grid(&samples, (GRID_SIDE, GRID_SIDE), &path)?;
        tracing::info!(path = %path.display(), "samples saved");
        Ok(())
    }

    fn render_frozen_samples(&self) -> anyhow::Result<Tensor> {
        let rows = self.sample_z.dim(0)?;
        let out = self.generator.generate(
            &self.sample_z,
            rows,
            self.sample_y.as_ref(),
            UpdateCollection::NoOps,
        )?;
        Ok(out.samples.detach())
    }

    /// Write `{key}_real` / `{key}_fake` for the last sorted discriminator
    /// layers into `layer_outputs_{step}.npz`.
    fn save_layers(&mut self, step: usize) -> anyhow::Result<()> {
        let mut keys: Option<Vec<String>> = None;
        let mut real_rows: Vec<Vec<Tensor>> = Vec::new();
        let mut fake_rows: Vec<Vec<Tensor>> = Vec::new();
        let mut collected = 0;
        while collected < LAYER_DUMP_ROWS {
            let batch = self.collaborators.pipeline.connect()?;
            let images = batch.images.to_device(&self.device)?;
            let real_labels = batch.labels.map(|l| l.to_device(&self.device)).transpose()?;
            let real = self.discriminator.discriminate(
                &images,
                images.dim(0)?,
                real_labels.as_ref(),
                UpdateCollection::NoOps,
            )?;
            let (fake_images, fake_labels) = self.generate_fresh(self.config.batch_size)?;
            let fake = self.discriminator.discriminate(
                &fake_images,
                self.config.batch_size,
                fake_labels.as_ref(),
                UpdateCollection::NoOps,
            )?;
            let keys = keys.get_or_insert_with(|| {
                let all = real.keys();
                all[all.len().saturating_sub(LAYER_DUMP_LAST)..].to_vec()
            });
            let mut r = Vec::with_capacity(keys.len());
            let mut f = Vec::with_capacity(keys.len());
            for key in keys.iter() {
                r.push(layer(&real, key)?.detach());
                f.push(layer(&fake, key)?.detach());
            }
            collected += images.dim(0)?.min(self.config.batch_size);
            real_rows.push(r);
            fake_rows.push(f);
        }
        let keys = keys.unwrap_or_default();
        let mut named = Vec::with_capacity(2 * keys.len());
        for (i, key) in keys.iter().enumerate() {
            let real: Vec<Tensor> = real_rows.iter().map(|r| r[i].clone()).collect();
            let fake: Vec<Tensor> = fake_rows.iter().map(|f| f[i].clone()).collect();
            named.push((format!("{key}_real"), take_rows(&real, LAYER_DUMP_ROWS)?));
            named.push((format!("{key}_fake"), take_rows(&fake, LAYER_DUMP_ROWS)?));
        }
        let path = self.dirs.sample.join(format!("layer_outputs_{step}.npz"));
        save_npz(&path, &named)?;
        tracing::info!(path = %path.display(), "layer outputs saved");
        Ok(())
    }

    fn score(&mut self, step: usize) -> bool {
        if !self.config.compute_scores {
            return false;
        }
        let Some(scorer) = self.collaborators.scorer.clone() else {
            return false;
        };
        if !scorer.is_due(step) {
            return false;
        }
        let outcome = self.render_frozen_samples().and_then(|samples| {
            let real = self.collaborators.pipeline.connect()?;
            let real = real.images.to_device(&self.device)?;
            scorer.compute(&ScoreContext { samples: &samples, real: &real }, step)
        });
        match outcome {
            Ok(o) => o.request_decay,
            Err(e) => {
                tracing::warn!(step, error = %e, "scorer failed");
                false
            }
        }
    }

    // ── Sampling ────────────────────────────────────────────────────────────

    /// Render `n` samples from fresh latents (and the selected discriminator
    /// features of those samples) into `{key}.npy` files in the sample
    /// directory. Samples are stored as `(n, c, h, w)`.
    pub fn export_samples(&mut self, n: usize, layers: LayerSelection) -> anyhow::Result<Vec<std::path::PathBuf>> {
        let bs = self.config.batch_size;
        let mut samples = Vec::new();
        let mut features: Vec<(String, Vec<Tensor>)> = Vec::new();
        let mut collected = 0;
        while collected < n {
            let (out, labels) = self.generate_fresh(bs)?;
            if layers != LayerSelection::None {
                let layer_outputs =
                    self.discriminator
                        .discriminate(&out, bs, labels.as_ref(), UpdateCollection::NoOps)?;
                let keys = layer_outputs.keys();
                let chosen = match layers {
                    LayerSelection::All | LayerSelection::None => keys,
                    LayerSelection::Last(k) => keys[keys.len().saturating_sub(k)..].to_vec(),
                };
                if features.is_empty() {
                    features = chosen.iter().map(|k| (format!("{k}_features"), Vec::new())).collect();
                }
                for (slot, key) in features.iter_mut().zip(&chosen) {
                    slot.1.push(layer(&layer_outputs, key)?.detach());
                }
            }
            samples.push(out);
            collected += bs;
        }
        let mut named = vec![("samples".to_string(), take_rows(&samples, n)?)];
        for (key, parts) in features {
            named.push((key, take_rows(&parts, n)?));
        }
        save_npy_each(&self.dirs.sample, &named)
    }

    /// Samples from fresh latents, with the labels they were generated for.
    fn generate_fresh(&mut self, rows: usize) -> anyhow::Result<(Tensor, Option<Tensor>)> {
        let z = uniform_latents(&mut self.rng, rows, self.config.z_dim, &self.device)?;
        let labels = self.generator_labels(rows)?;
        let out = self
            .generator
            .generate(&z, rows, labels.as_ref(), UpdateCollection::NoOps)?;
        Ok((out.samples.detach(), labels))
    }

    fn generator_labels(&mut self, rows: usize) -> anyhow::Result<Option<Tensor>> {
        if !self.config.with_labels {
            return Ok(None);
        }
        Ok(Some(random_labels(&mut self.rng, rows, self.config.num_classes, &self.device)?))
    }
}

/// Build a [`Trainer`] with the default collaborators for `config`.
pub fn trainer_from_config(config: TrainingConfig, device: Device) -> anyhow::Result<Trainer> {
    let dirs = RunDirs::from_config(&config)?;
    dirs.ensure()?;
    let collaborators = Collaborators::from_config(&config, &dirs)?;
    Trainer::new(config, dirs, device, collaborators)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn uniform_latents(rng: &mut StdRng, rows: usize, dim: usize, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..rows * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(data, (rows, dim), device)
}

fn random_labels(rng: &mut StdRng, rows: usize, classes: usize, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<u32> = (0..rows).map(|_| rng.gen_range(0..classes as u32)).collect();
    Tensor::from_vec(data, rows, device)
}

fn layer<'a>(outputs: &'a mmd_core::LayerOutputs, key: &str) -> anyhow::Result<&'a Tensor> {
    outputs
        .get(key)
        .with_context(|| format!("discriminator did not return layer '{key}'"))
}

/// Concatenate along rows and keep the first `n`.
fn take_rows(parts: &[Tensor], n: usize) -> anyhow::Result<Tensor> {
    let all = Tensor::cat(parts, 0)?;
    let n = n.min(all.dim(0)?);
    Ok(all.narrow(0, 0, n)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
