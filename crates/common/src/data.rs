//! Input pipeline: batch sources and a bounded prefetching front-end.
//!
//! The training core only sees [`InputPipeline`]: `start`, `connect` (one real
//! batch per call) and `stop`. Batches are `(batch, c, h, w)` f32 images in
//! `[0, 1]` plus optional `(batch,)` u32 labels, always on the CPU; towers move
//! them to the compute device.
//!
//! * **[`SyntheticSource`]** — Gaussian blobs, one fixed centre per class.
//! * **[`NpySource`]** — images (and labels) loaded from `.npy` files.
//! * **[`PrefetchPipeline`]** — runs a source on a producer thread behind a
//!   `sync_channel`; the producer blocks once the queue is full.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::TrainingConfig;
use crate::error::TrainError;

/// One shard of real data.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.images.dim(0)?)
    }
}

/// Contract between the training core and whatever produces real samples.
pub trait InputPipeline: Send {
    /// Begin producing batches ahead of consumption.
    fn start(&mut self) -> Result<()>;
    /// Next real batch (`batch_size` rows).
    fn connect(&mut self) -> Result<Batch>;
    /// Stop producing and release background resources.
    fn stop(&mut self);
}

/// Synchronous producer of batches, driven by [`PrefetchPipeline`].
pub trait BatchSource: Send + 'static {
    fn next_batch(&mut self) -> Result<Batch>;
}

// ── SyntheticSource ─────────────────────────────────────────────────────────

/// Images containing one Gaussian blob whose position encodes the class.
pub struct SyntheticSource {
    rng: StdRng,
    batch_size: usize,
    channels: usize,
    size: usize,
    centres: Vec<(f32, f32)>,
    sigma: f32,
    with_labels: bool,
}

impl SyntheticSource {
    pub fn new(
        batch_size: usize,
        channels: usize,
        size: usize,
        num_classes: usize,
        with_labels: bool,
        seed: u64,
    ) -> Self {
        // Centres on a circle of radius size/4 around the middle of the image.
        let classes = num_classes.max(1);
        let mid = (size as f32 - 1.0) / 2.0;
        let radius = size as f32 / 4.0;
        let centres = (0..classes)
            .map(|k| {
                let theta = 2.0 * std::f32::consts::PI * k as f32 / classes as f32;
                (mid + radius * theta.cos(), mid + radius * theta.sin())
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(seed),
            batch_size,
            channels,
            size,
            centres,
            sigma: (size as f32 / 8.0).max(0.5),
            with_labels,
        }
    }
}

impl BatchSource for SyntheticSource {
    fn next_batch(&mut self) -> Result<Batch> {
        let (b, c, s) = (self.batch_size, self.channels, self.size);
        let mut pixels = Vec::with_capacity(b * c * s * s);
        let mut labels = Vec::with_capacity(b);
        for _ in 0..b {
            let class = self.rng.gen_range(0..self.centres.len());
            let (cy, cx) = self.centres[class];
            let jitter_y: f32 = self.rng.gen_range(-0.5..0.5);
            let jitter_x: f32 = self.rng.gen_range(-0.5..0.5);
            for _ in 0..c {
                for y in 0..s {
                    for x in 0..s {
                        let dy = y as f32 - cy - jitter_y;
                        let dx = x as f32 - cx - jitter_x;
                        let v = (-(dy * dy + dx * dx) / (2.0 * self.sigma * self.sigma)).exp();
                        pixels.push(v);
                    }
                }
            }
            labels.push(class as u32);
        }
        let images = Tensor::from_vec(pixels, (b, c, s, s), &Device::Cpu)?;
        let labels = if self.with_labels {
            Some(Tensor::from_vec(labels, b, &Device::Cpu)?)
        } else {
            None
        };
        Ok(Batch { images, labels })
    }
}

// ── NpySource ───────────────────────────────────────────────────────────────

/// Shuffled epochs over an in-memory image array read from `.npy`.
pub struct NpySource {
    images: Tensor,
    labels: Option<Tensor>,
    order: Vec<u32>,
    cursor: usize,
    batch_size: usize,
    rng: StdRng,
}

impl NpySource {
    /// Load `(n, c, h, w)` or `(n, h, w)` images; `labels` must hold `n` integers.
    pub fn open(
        images: &Path,
        labels: Option<&Path>,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let images = Tensor::read_npy(images)
            .with_context(|| format!("read images from {}", images.display()))?
            .to_dtype(DType::F32)?;
        let images = match images.rank() {
            3 => images.unsqueeze(1)?,
            4 => images,
            r => anyhow::bail!("expected images of rank 3 or 4, got rank {r}"),
        };
        let n = images.dim(0)?;
        if n < batch_size {
            anyhow::bail!("dataset has {n} images, fewer than one batch of {batch_size}");
        }
        let labels = match labels {
            Some(p) => {
                let l = Tensor::read_npy(p)
                    .with_context(|| format!("read labels from {}", p.display()))?
                    .to_dtype(DType::U32)?
                    .flatten_all()?;
                if l.dim(0)? != n {
                    anyhow::bail!("{} labels for {n} images", l.dim(0)?);
                }
                Some(l)
            }
            None => None,
        };
        let mut source = Self {
            images,
            labels,
            order: (0..n as u32).collect(),
            cursor: 0,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        };
        source.order.shuffle(&mut source.rng);
        Ok(source)
    }

    pub fn num_images(&self) -> usize {
        self.order.len()
    }
}

impl BatchSource for NpySource {
    fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let idx = &self.order[self.cursor..self.cursor + self.batch_size];
        self.cursor += self.batch_size;
        let idx = Tensor::new(idx, &Device::Cpu)?;
        let images = self.images.index_select(&idx, 0)?;
        let labels = match &self.labels {
            Some(l) => Some(l.index_select(&idx, 0)?),
            None => None,
        };
        Ok(Batch { images, labels })
    }
}

// ── PrefetchPipeline ────────────────────────────────────────────────────────

/// Bounded prefetching front-end over a [`BatchSource`].
///
/// Before [`start`](InputPipeline::start) (and after `stop`), `connect` pulls
/// from the source synchronously.
pub struct PrefetchPipeline<S: BatchSource> {
    source: Option<S>,
    capacity: usize,
    rx: Option<Receiver<Result<Batch>>>,
    producer: Option<JoinHandle<S>>,
}

impl<S: BatchSource> PrefetchPipeline<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source: Some(source),
            capacity: capacity.max(1),
            rx: None,
            producer: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        self.producer.is_some()
    }
}

fn produce<S: BatchSource>(mut source: S, tx: SyncSender<Result<Batch>>) -> S {
    loop {
        let batch = source.next_batch();
        let failed = batch.is_err();
        // `send` blocks while the queue is full; it errors once the consumer hung up.
        if tx.send(batch).is_err() || failed {
            return source;
        }
    }
}

impl<S: BatchSource> InputPipeline for PrefetchPipeline<S> {
    fn start(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Ok(());
        }
        let source = self
            .source
            .take()
            .context("pipeline source lost after a producer failure")?;
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        let producer = std::thread::Builder::new()
            .name("mmd-prefetch".into())
            .spawn(move || produce(source, tx))
            .context("spawn prefetch thread")?;
        self.rx = Some(rx);
        self.producer = Some(producer);
        tracing::debug!(capacity = self.capacity, "prefetch pipeline started");
        Ok(())
    }

    fn connect(&mut self) -> Result<Batch> {
        if let Some(rx) = &self.rx {
            return rx
                .recv()
                .map_err(|_| anyhow::anyhow!("prefetch producer exited"))?;
        }
        match self.source.as_mut() {
            Some(source) => source.next_batch(),
            None => anyhow::bail!("pipeline has no source"),
        }
    }

    fn stop(&mut self) {
        // Hang up first so a producer blocked on a full queue wakes up.
        self.rx = None;
        if let Some(producer) = self.producer.take() {
            match producer.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => tracing::warn!("prefetch producer panicked"),
            }
        }
    }
}

impl<S: BatchSource> Drop for PrefetchPipeline<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Construction from config ────────────────────────────────────────────────

/// Build the pipeline named by `config.dataset`.
///
/// * `synthetic` — [`SyntheticSource`].
/// * `path/to/images.npy` — [`NpySource`]; labels are read from
///   `path/to/images.labels.npy` when `with_labels` is set.
///
/// The prefetch queue holds `4 · num_replicas` batches.
pub fn pipeline_from_config(config: &TrainingConfig) -> Result<Box<dyn InputPipeline>> {
    let batch_size = config.real_batch_size();
    let capacity = 4 * config.num_replicas;
    if config.dataset == "synthetic" {
        let source = SyntheticSource::new(
            batch_size,
            config.c_dim,
            config.output_size,
            config.num_classes,
            config.with_labels,
            config.seed,
        );
        return Ok(Box::new(PrefetchPipeline::new(source, capacity)));
    }
    let path = PathBuf::from(&config.dataset);
    if path.extension().map(|e| e == "npy").unwrap_or(false) {
        let labels = path.with_extension("labels.npy");
        let labels = config.with_labels.then_some(labels.as_path());
        let source = NpySource::open(&path, labels, batch_size, config.seed)?;
        tracing::info!(images = source.num_images(), path = %path.display(), "loaded dataset");
        return Ok(Box::new(PrefetchPipeline::new(source, capacity)));
    }
    Err(TrainError::Config(format!("unknown dataset '{}'", config.dataset)).into())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_batch_shapes() {
        let mut source = SyntheticSource::new(4, 1, 8, 3, true, 7);
        let batch = source.next_batch().unwrap();
        assert_eq!(batch.images.dims(), &[4, 1, 8, 8]);
        let labels: Vec<u32> = batch.labels.unwrap().to_vec1().unwrap();
        assert!(labels.iter().all(|&l| l < 3));
        let max = batch.images.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0 && max > 0.5);
    }

    #[test]
    fn synthetic_without_labels() {
        let mut source = SyntheticSource::new(2, 3, 4, 1, false, 0);
        let batch = source.next_batch().unwrap();
        assert!(batch.labels.is_none());
        assert_eq!(batch.batch_size().unwrap(), 2);
    }

    #[test]
    fn prefetch_delivers_batches_and_stops() {
        let source = SyntheticSource::new(2, 1, 4, 2, false, 1);
        let mut pipe = PrefetchPipeline::new(source, 2);
        pipe.start().unwrap();
        assert!(pipe.is_running());
        for _ in 0..5 {
            let batch = pipe.connect().unwrap();
            assert_eq!(batch.images.dims(), &[2, 1, 4, 4]);
        }
        pipe.stop();
        assert!(!pipe.is_running());
        // Synchronous fallback after stop.
        assert!(pipe.connect().is_ok());
    }

    #[test]
    fn npy_source_cycles_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.npy");
        let images = Tensor::rand(0f32, 1f32, (5, 2, 2), &Device::Cpu).unwrap();
        images.write_npy(&path).unwrap();
        let mut source = NpySource::open(&path, None, 2, 0).unwrap();
        assert_eq!(source.num_images(), 5);
        for _ in 0..6 {
            let batch = source.next_batch().unwrap();
            assert_eq!(batch.images.dims(), &[2, 1, 2, 2]);
        }
    }

    #[test]
    fn unknown_dataset_is_config_error() {
        let config = TrainingConfig {
            dataset: "imagenet".into(),
            ..Default::default()
        };
        let err = pipeline_from_config(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::Config(_))
        ));
    }
}
