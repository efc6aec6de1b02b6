//! # mmd-core — The Loss Engine
//!
//! Everything a tower needs to turn a real batch and a latent batch into a
//! generator loss and a discriminator loss:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`kernel`] | `Kernel` catalogue (`dot`, `poly`, `mix_rbf`, `mix_rq`, `distance`), unbiased MMD² |
//! | [`penalty`] | gradient penalty, L2 activation penalty, Jacobian scaling |
//! | [`loss`] | `LossComposer` (kernel statistic + active regularisers) |
//! | [`networks`] | `Generator` / `Discriminator` contracts, reference MLP pair |
//! | [`params`] | `ParameterGroups` (`g_*` / `d_*` partition of a `VarMap`) |
//! | [`autograd`] | second-order backprop switch, input gradients |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Networks are collaborators.** The loss only sees the two traits and a
//!    map of named layer outputs.
//! 3. **Losses stay attached.** Every returned loss tensor can be passed to
//!    `backward()` directly.

pub mod autograd;
pub mod kernel;
pub mod loss;
pub mod networks;
pub mod params;
pub mod penalty;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use kernel::{kernel_by_name, mmd2, mmd2_between, Kernel, KernelMatrices, KERNEL_NAMES};
pub use loss::{Coefficients, ComposedLoss, LossComposer, LossDiagnostics, LossInputs};
pub use networks::{
    build_networks, Discriminator, Generated, Generator, LayerOutputs, StatUpdate, UpdateCollection,
    FEATURE_KEY,
};
pub use params::{Group, ParameterGroups};
