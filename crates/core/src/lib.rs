//! # dann-core — Domain-Adversarial Building Blocks
//!
//! Everything needed to assemble gradient-reversal domain-adaptation
//! models on candle:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`grad_reverse`] | `GrlSchedule`, `reverse_grad`, `reverse_grad_residual`, `GradReverseLayer` |
//! | [`init`] | `InitScheme` (per-layer-kind weight initialisation) |
//! | [`norm`] | `BatchNorm2d` with a frozen-statistics switch |
//! | [`block`] | `conv3x3`/`conv1x1`, WRN `ResidualUnit` |
//! | [`classifier`] | `WideResNet` (WRN-28-w, leaky ReLU 0.1) |
//! | [`discriminator`] | `DomainDiscriminator`, `AdversarialHead`, `MultiDomainDiscriminator` |
//! | [`generator`] | `FeatureEncoder` / `FeatureDecoder` translation pair |
//! | [`model`] | `DomainAdaptModel`, `param_stats` |
//!
//! ## Design principles
//!
//! 1. **Everything through `candle-core`/`candle-nn`.** The gradient
//!    reversal at the heart of the crate is a `CustomOp1` with an explicit
//!    backward rule; an equivalent detach-residual form covers graphs where
//!    a custom op is inconvenient.
//! 2. **Per-module state, no ambient modes.** Step counters and
//!    frozen-statistics switches live on the modules that use them and are
//!    set explicitly; nothing is inferred from a global train/eval flag.
//! 3. **Deterministic.** Same inputs + same step counters = same outputs
//!    and same gradients, for either reversal form.

pub mod block;
pub mod classifier;
pub mod discriminator;
pub mod generator;
pub mod grad_reverse;
pub mod init;
pub mod model;
pub mod norm;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use classifier::WideResNet;
pub use discriminator::{AdversarialHead, DomainDiscriminator, MultiDomainDiscriminator};
pub use generator::{FeatureDecoder, FeatureEncoder};
pub use grad_reverse::{
    reverse_grad, reverse_grad_residual, GradReverseLayer, GrlForm, GrlSchedule,
};
pub use model::{param_stats, DomainAdaptModel, ModelOutput, ParamStats};
pub use norm::BatchNorm2d;
