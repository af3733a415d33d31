//! Full domain-adaptation model: WRN classifier + adversarial discriminator.
//!
//! The discriminator reads the classifier's pooled features through its
//! gradient-reversal layer, so a single backward pass trains the
//! discriminator to separate domains while pushing the classifier's
//! features toward domain invariance.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use dann_common::DomainAdaptConfig;

use crate::classifier::{unit_specs, WideResNet};
use crate::discriminator::DomainDiscriminator;

/// One forward pass over a batch.
pub struct ModelOutput {
    /// Pooled (optionally tanh-squashed) classifier features.
    pub features: Tensor,
    /// Class logits.
    pub class_logits: Tensor,
    /// Clamped domain probabilities from the adversarial head.
    pub domain_probs: Tensor,
}

/// Classifier + discriminator pair.
pub struct DomainAdaptModel {
    classifier: WideResNet,
    discriminator: DomainDiscriminator,
}

impl DomainAdaptModel {
    pub fn new(config: &DomainAdaptConfig, vb: VarBuilder) -> Result<Self> {
        let classifier = WideResNet::new(config, vb.pp("classifier"))?;
        let discriminator =
            DomainDiscriminator::new(classifier.feature_dim(), config, vb.pp("discriminator"))?;

        let stats = param_stats(config);
        tracing::info!(
            classifier_params = stats.classifier_params,
            discriminator_params = stats.discriminator_params,
            total_params = stats.total_params,
            "Built domain-adaptation model"
        );

        Ok(Self {
            classifier,
            discriminator,
        })
    }

    pub fn classifier(&self) -> &WideResNet {
        &self.classifier
    }

    pub fn discriminator(&self) -> &DomainDiscriminator {
        &self.discriminator
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<ModelOutput> {
        let (features, class_logits) = self.classifier.forward_t(x, train)?;
        let domain_probs = self.discriminator.forward_t(&features, train)?;
        Ok(ModelOutput {
            features,
            class_logits,
            domain_probs,
        })
    }

    /// Flip the frozen-statistics switch on every batch norm in the
    /// classifier (the discriminator has none).
    pub fn set_update_batch_stats(&self, flag: bool) {
        self.classifier.set_update_batch_stats(flag);
    }
}

// ── Parameter stats ─────────────────────────────────────────────────────────

/// Trainable-parameter counts, computed from config alone. Running-stat
/// buffers are not counted.
#[derive(Debug, Clone)]
pub struct ParamStats {
    pub classifier_params: usize,
    pub discriminator_params: usize,
    pub total_params: usize,
}

/// Compute parameter counts from hyper-parameters — no model instance
/// needed.
pub fn param_stats(config: &DomainAdaptConfig) -> ParamStats {
    let feature_dim = config.feature_dim();

    // Classifier: init conv + 12 residual units + output norm + head.
    let mut classifier = config.in_channels * 16 * 9;
    for spec in unit_specs(config.width) {
        classifier += 2 * spec.in_c; // bn1 scale + shift
        classifier += spec.in_c * spec.out_c * 9; // conv1
        classifier += 2 * spec.out_c; // bn2
        classifier += spec.out_c * spec.out_c * 9; // conv2
        if spec.stride >= 2 || spec.in_c != spec.out_c {
            classifier += spec.in_c * spec.out_c; // 1×1 shortcut
        }
    }
    classifier += 2 * feature_dim; // bn_out
    classifier += feature_dim * config.num_classes + config.num_classes; // head

    // Discriminator: three Linear layers with bias.
    let h = config.disc_hidden;
    let discriminator = (feature_dim * h + h) + (h * h + h) + (h + 1);

    ParamStats {
        classifier_params: classifier,
        discriminator_params: discriminator,
        total_params: classifier + discriminator,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
