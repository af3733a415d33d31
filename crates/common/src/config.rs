//! Model configuration for domain-adversarial experiments.
//!
//! Serialised as JSON so an experiment directory can carry its exact
//! hyper-parameters. Every field has a default, so a minimal `{}` JSON
//! produces a working (SVHN-sized) configuration. Missing fields fall back
//! to their `#[serde(default)]` values.

use serde::{Deserialize, Serialize};

// ── Gradient-reversal schedule parameters ───────────────────────────────────

/// Parameters of the gradient-reversal coefficient ramp.
///
/// The coefficient follows a saturating sigmoid in the step count:
///
/// ```text
/// coeff(step) = 2(high-low) / (1 + exp(-alpha · step / max_iter)) - (high-low) + low
/// ```
///
/// `warmup_steps` holds the coefficient at exactly 0 until the module's
/// step counter reaches it; the ramp then starts from `step - warmup_steps`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrlParams {
    /// Coefficient at step 0 (ramp floor).
    #[serde(default)]
    pub low: f64,
    /// Asymptotic coefficient as step → ∞ (ramp ceiling).
    #[serde(default = "default_grl_high")]
    pub high: f64,
    /// Ramp steepness. Larger values saturate earlier.
    #[serde(default = "default_grl_alpha")]
    pub alpha: f64,
    /// Saturation horizon in steps. Must be > 0.
    #[serde(default = "default_grl_max_iter")]
    pub max_iter: f64,
    /// Steps during which the coefficient is held at 0 (no reversal).
    #[serde(default)]
    pub warmup_steps: u64,
}

fn default_grl_high() -> f64 {
    1.0
}
fn default_grl_alpha() -> f64 {
    10.0
}
fn default_grl_max_iter() -> f64 {
    10_000.0
}

impl Default for GrlParams {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
            alpha: 10.0,
            max_iter: 10_000.0,
            warmup_steps: 0,
        }
    }
}

impl GrlParams {
    /// Check parameter sanity. Invalid schedules are rejected here rather
    /// than producing NaN/Inf coefficients mid-training.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.low.is_finite() || !self.high.is_finite() {
            anyhow::bail!(
                "grl bounds must be finite (low={}, high={})",
                self.low,
                self.high
            );
        }
        if self.high < self.low {
            anyhow::bail!("grl high ({}) must be >= low ({})", self.high, self.low);
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            anyhow::bail!("grl alpha must be > 0, got {}", self.alpha);
        }
        if !(self.max_iter.is_finite() && self.max_iter > 0.0) {
            anyhow::bail!("grl max_iter must be > 0, got {}", self.max_iter);
        }
        Ok(())
    }
}

// ── Model configuration ─────────────────────────────────────────────────────

/// Configuration for the WRN classifier + adversarial discriminator pair.
///
/// Stored alongside checkpoints for reproducible experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainAdaptConfig {
    // ── Classifier dimensions ───────────────────────────────────────────────
    /// WRN-28 width multiplier (filters are [16, 16w, 32w, 64w]).
    #[serde(default = "default_width")]
    pub width: usize,
    /// Number of target classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Input image channels (3 for SVHN/CIFAR, 1 or 2 for translated features).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    // ── Architecture switches ───────────────────────────────────────────────
    /// Squash pooled features through tanh before the classifier head.
    #[serde(default = "default_true")]
    pub tanh_features: bool,
    /// Initial state of the per-module frozen-statistics switch on every
    /// batch-norm layer. `false` means: normalise with the current batch's
    /// statistics and never touch the running buffers.
    #[serde(default = "default_true")]
    pub update_batch_stats: bool,

    // ── Layer hyper-parameters ──────────────────────────────────────────────
    /// LeakyReLU negative slope.
    #[serde(default = "default_leaky_slope")]
    pub leaky_slope: f64,
    /// Batch-norm running-statistics momentum.
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,
    /// Batch-norm epsilon.
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,
    /// Dropout probability in discriminator MLPs.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    // ── Discriminator dimensions ────────────────────────────────────────────
    /// Hidden width of the binary domain discriminator.
    #[serde(default = "default_disc_hidden")]
    pub disc_hidden: usize,
    /// Bottleneck width of the multi-domain discriminator.
    #[serde(default = "default_bottleneck_dim")]
    pub bottleneck_dim: usize,

    // ── Gradient reversal ───────────────────────────────────────────────────
    /// Coefficient ramp for the discriminator's gradient-reversal layer.
    #[serde(default = "default_grl")]
    pub grl: GrlParams,
}

fn default_width() -> usize {
    2
}
fn default_num_classes() -> usize {
    10
}
fn default_in_channels() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_leaky_slope() -> f64 {
    0.1
}
fn default_bn_momentum() -> f64 {
    1e-3
}
fn default_bn_eps() -> f64 {
    1e-3
}
fn default_dropout() -> f32 {
    0.5
}
fn default_disc_hidden() -> usize {
    1024
}
fn default_bottleneck_dim() -> usize {
    128
}
fn default_grl() -> GrlParams {
    GrlParams {
        max_iter: 20_000.0,
        ..GrlParams::default()
    }
}

impl Default for DomainAdaptConfig {
    fn default() -> Self {
        Self {
            width: 2,
            num_classes: 10,
            in_channels: 3,
            tanh_features: true,
            update_batch_stats: true,
            leaky_slope: 0.1,
            bn_momentum: 1e-3,
            bn_eps: 1e-3,
            dropout: 0.5,
            disc_hidden: 1024,
            bottleneck_dim: 128,
            grl: default_grl(),
        }
    }
}

impl DomainAdaptConfig {
    /// Dimension of the pooled feature vector (last WRN filter bank).
    pub fn feature_dim(&self) -> usize {
        64 * self.width
    }

    /// Check configuration sanity before building a model.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 {
            anyhow::bail!("width must be >= 1");
        }
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be >= 1");
        }
        if self.in_channels == 0 {
            anyhow::bail!("in_channels must be >= 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if !(self.bn_eps.is_finite() && self.bn_eps > 0.0) {
            anyhow::bail!("bn_eps must be > 0, got {}", self.bn_eps);
        }
        if !(0.0..1.0).contains(&self.bn_momentum) {
            anyhow::bail!("bn_momentum must be in [0, 1), got {}", self.bn_momentum);
        }
        self.grl.validate()
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file and validate it.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
