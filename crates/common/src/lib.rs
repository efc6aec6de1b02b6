//! # mmd-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`TrainingConfig`]** — run hyper-parameters (serialised as JSON).
//! * **[`RunDirs`]** — checkpoint / log / sample directories of one run.
//! * **[`TrainError`]** — the failures the training driver distinguishes.
//! * **[`InputPipeline`]** / **[`PrefetchPipeline`]** — real-data batches.

pub mod config;
pub mod data;
pub mod error;

pub use config::{RunDirs, ScalingVariant, TrainingConfig};
pub use data::{
    pipeline_from_config, Batch, BatchSource, InputPipeline, NpySource, PrefetchPipeline,
    SyntheticSource,
};
pub use error::{LossKind, TrainError};
