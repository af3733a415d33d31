//! # dann-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`DomainAdaptConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`GrlParams`]** — gradient-reversal coefficient-ramp parameters.

pub mod config;

pub use config::{DomainAdaptConfig, GrlParams};
