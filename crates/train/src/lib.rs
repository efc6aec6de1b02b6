//! # mmd-train — The Training Driver
//!
//! Alternating discriminator / generator training over data-parallel towers:
//!
//! * **[`Trainer`]** — owns the networks, optimisers and counters. One call
//!   to [`Trainer::train_step`] runs every tower, checks for NaN, averages
//!   gradients and applies exactly one optimizer update.
//! * **[`scheduler`]** — which group a step updates, and when summaries fire.
//! * **[`tower`]** / **[`aggregate`]** — replica execution and gradient /
//!   running-statistic averaging.
//! * **[`CheckpointManager`]** — weights + counters with bounded retention.
//! * **[`cadence`]** — checkpoint, sample-grid and layer-dump steps.
//! * **[`SummarySink`]** / **[`Scorer`]** — pluggable observers.

pub mod aggregate;
pub mod cadence;
pub mod checkpoint;
pub mod optim;
pub mod sample;
pub mod scheduler;
pub mod scorer;
pub mod telemetry;
pub mod timer;
pub mod tower;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointMeta, CHECKPOINT_PREFIX};
pub use optim::{HyperState, OptimizerBank, MIN_LEARNING_RATE};
pub use scheduler::{advance, should_emit_summary, Cadence, SchedulerState, StepKind};
pub use scorer::{MmdScorer, ScoreContext, ScoreOutcome, Scorer};
pub use telemetry::{JsonlSummaryWriter, NullSink, SummaryRecord, SummarySink};
pub use timer::ProgressTimer;
pub use trainer::{
    trainer_from_config, Collaborators, LayerSelection, StepOutcome, Trainer, TrainingContext,
};
