//! Adversarial discriminator heads.
//!
//! Every head puts a gradient-reversal layer in front of a small MLP: the
//! head itself learns to predict the domain of a feature vector, while the
//! reversed gradient trains the upstream feature extractor to defeat it.
//!
//! | Head | GRL form | Output |
//! |------|----------|--------|
//! | [`DomainDiscriminator`] | custom op | binary domain probability, clamped |
//! | [`AdversarialHead`] | detach residual | binary domain probability |
//! | [`MultiDomainDiscriminator`] | custom op | per-domain logits + probabilities |

use candle_core::{Result, Tensor};
use candle_nn::{ops, Dropout, Linear, Module, VarBuilder};

use dann_common::{DomainAdaptConfig, GrlParams};

use crate::grad_reverse::{GradReverseLayer, GrlForm};
use crate::init::linear_xavier;

/// Predicted probabilities are clamped to [ε, 1-ε] so the adversarial
/// log-loss stays finite even when the head saturates.
const PROB_CLAMP: f64 = 1e-2;

// ── Binary domain discriminator ─────────────────────────────────────────────

/// Binary source/target discriminator over pooled classifier features.
///
/// GRL → Linear(in, hidden) → ReLU → Dropout → Linear(hidden, hidden) →
/// ReLU → Dropout → Linear(hidden, 1) → sigmoid → clamp.
pub struct DomainDiscriminator {
    grl: GradReverseLayer,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    drop1: Dropout,
    drop2: Dropout,
}

impl DomainDiscriminator {
    pub fn new(in_features: usize, config: &DomainAdaptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.disc_hidden;
        Ok(Self {
            grl: GradReverseLayer::new(&config.grl)?,
            fc1: linear_xavier(in_features, hidden, vb.pp("fc1"))?,
            fc2: linear_xavier(hidden, hidden, vb.pp("fc2"))?,
            fc3: linear_xavier(hidden, 1, vb.pp("fc3"))?,
            drop1: Dropout::new(config.dropout),
            drop2: Dropout::new(config.dropout),
        })
    }

    /// The reversal layer, for step/coefficient introspection.
    pub fn grl(&self) -> &GradReverseLayer {
        &self.grl
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.grl.forward_t(x, train)?;
        let h = self.drop1.forward(&self.fc1.forward(&x)?.relu()?, train)?;
        let h = self.drop2.forward(&self.fc2.forward(&h)?.relu()?, train)?;
        let y = ops::sigmoid(&self.fc3.forward(&h)?)?;
        y.clamp(PROB_CLAMP, 1.0 - PROB_CLAMP)
    }
}

// ── Hook-style adversarial head ─────────────────────────────────────────────

/// Discriminator head using the detach-residual reversal form.
///
/// Mathematically interchangeable with [`DomainDiscriminator`]'s custom-op
/// reversal; kept as a separate head because it carries its own iteration
/// counter and hidden width, matching setups where several heads ramp
/// independently.
pub struct AdversarialHead {
    grl: GradReverseLayer,
    ad1: Linear,
    ad2: Linear,
    ad3: Linear,
    drop1: Dropout,
    drop2: Dropout,
}

impl AdversarialHead {
    pub fn new(
        in_features: usize,
        hidden: usize,
        grl: &GrlParams,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            grl: GradReverseLayer::with_form(grl, GrlForm::Residual)?,
            ad1: linear_xavier(in_features, hidden, vb.pp("ad1"))?,
            ad2: linear_xavier(hidden, hidden, vb.pp("ad2"))?,
            ad3: linear_xavier(hidden, 1, vb.pp("ad3"))?,
            drop1: Dropout::new(dropout),
            drop2: Dropout::new(dropout),
        })
    }

    pub fn grl(&self) -> &GradReverseLayer {
        &self.grl
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.grl.forward_t(x, train)?;
        let h = self.drop1.forward(&self.ad1.forward(&x)?.relu()?, train)?;
        let h = self.drop2.forward(&self.ad2.forward(&h)?.relu()?, train)?;
        ops::sigmoid(&self.ad3.forward(&h)?)
    }
}

// ── Multi-domain discriminator ──────────────────────────────────────────────

/// Output of [`MultiDomainDiscriminator`].
pub struct MultiDomainOutput {
    /// Bottlenecked features (`bottleneck_dim`).
    pub bottleneck: Tensor,
    /// Raw per-domain logits.
    pub logits: Tensor,
    /// Sigmoid of the logits.
    pub probs: Tensor,
}

/// Multi-domain discriminator with a feature bottleneck.
///
/// GRL → Linear(in, bottleneck) → MLP(256) → per-domain logits.
pub struct MultiDomainDiscriminator {
    grl: GradReverseLayer,
    bottleneck: Linear,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    out: Linear,
    drop1: Dropout,
    drop2: Dropout,
}

/// Hidden width of the multi-domain MLP.
const MULTI_HIDDEN: usize = 256;

impl MultiDomainDiscriminator {
    pub fn new(
        in_features: usize,
        num_domains: usize,
        config: &DomainAdaptConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bottleneck_dim = config.bottleneck_dim;
        Ok(Self {
            grl: GradReverseLayer::new(&config.grl)?,
            bottleneck: linear_xavier(in_features, bottleneck_dim, vb.pp("bottleneck"))?,
            fc1: linear_xavier(bottleneck_dim, MULTI_HIDDEN, vb.pp("fc1"))?,
            fc2: linear_xavier(MULTI_HIDDEN, MULTI_HIDDEN, vb.pp("fc2"))?,
            fc3: linear_xavier(MULTI_HIDDEN, MULTI_HIDDEN, vb.pp("fc3"))?,
            out: linear_xavier(MULTI_HIDDEN, num_domains, vb.pp("out"))?,
            drop1: Dropout::new(config.dropout),
            drop2: Dropout::new(config.dropout),
        })
    }

    pub fn grl(&self) -> &GradReverseLayer {
        &self.grl
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<MultiDomainOutput> {
        let x = self.grl.forward_t(x, train)?;
        let bottleneck = self.bottleneck.forward(&x)?;
        let h = self.drop1.forward(&self.fc1.forward(&bottleneck)?.relu()?, train)?;
        let h = self.drop2.forward(&self.fc2.forward(&h)?.relu()?, train)?;
        let h = self.fc3.forward(&h)?;
        let logits = self.out.forward(&h)?;
        let probs = ops::sigmoid(&logits)?;
        Ok(MultiDomainOutput {
            bottleneck,
            logits,
            probs,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn binary_head_clamps_probabilities() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let config = DomainAdaptConfig::default();
        let disc = DomainDiscriminator::new(128, &config, vb).unwrap();

        // Large-magnitude features push the sigmoid into saturation; the
        // clamp must keep outputs strictly inside (0, 1).
        let x = Tensor::randn(0f32, 50f32, (4, 128), &dev).unwrap();
        let y = disc.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[4, 1]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|&v| (0.01..=0.99).contains(&v)));
    }

    #[test]
    fn grl_counter_tracks_training_calls() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let config = DomainAdaptConfig::default();
        let disc = DomainDiscriminator::new(64, &config, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 64), &dev).unwrap();
        disc.forward_t(&x, true).unwrap();
        disc.forward_t(&x, true).unwrap();
        disc.forward_t(&x, false).unwrap();
        assert_eq!(disc.grl().step(), 2);
    }

    #[test]
    fn hook_head_shapes_and_counter() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let params = GrlParams::default();
        let head = AdversarialHead::new(64, 256, &params, 0.5, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 64), &dev).unwrap();
        let y = head.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[3, 1]);
        assert_eq!(head.grl().step(), 1);
    }

    #[test]
    fn multi_domain_output_shapes() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let config = DomainAdaptConfig::default();
        let disc = MultiDomainDiscriminator::new(128, 6, &config, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 128), &dev).unwrap();
        let out = disc.forward_t(&x, false).unwrap();
        assert_eq!(out.bottleneck.dims(), &[2, 128]);
        assert_eq!(out.logits.dims(), &[2, 6]);
        assert_eq!(out.probs.dims(), &[2, 6]);
        let probs: Vec<f32> = out.probs.flatten_all().unwrap().to_vec1().unwrap();
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }
}
