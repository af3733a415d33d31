//! WRN-28 classifier with leaky ReLU (negative slope 0.1).
//!
//! One parameterised implementation covers the SVHN/MNIST/CIFAR experiment
//! variants: input channel count, class count, and whether
//! the pooled features pass through tanh all come from
//! [`DomainAdaptConfig`].

use candle_core::{Result, Tensor, D};
use candle_nn::{Conv2d, Linear, Module, VarBuilder};

use dann_common::DomainAdaptConfig;

use crate::block::{conv3x3, leaky_relu, ResidualUnit};
use crate::init::linear_xavier;
use crate::norm::BatchNorm2d;

/// Per-unit layout of the three WRN groups (4 units each; the first unit of
/// a group changes width and, for groups 2 and 3, strides down).
pub(crate) struct UnitSpec {
    pub in_c: usize,
    pub out_c: usize,
    pub stride: usize,
    pub activate_before_residual: bool,
}

pub(crate) fn unit_specs(width: usize) -> Vec<UnitSpec> {
    let filters = [16, 16 * width, 32 * width, 64 * width];
    let mut specs = Vec::with_capacity(12);
    for group in 0..3 {
        let (in_c, out_c) = (filters[group], filters[group + 1]);
        let stride = if group == 0 { 1 } else { 2 };
        specs.push(UnitSpec {
            in_c,
            out_c,
            stride,
            activate_before_residual: group == 0,
        });
        for _ in 1..4 {
            specs.push(UnitSpec {
                in_c: out_c,
                out_c,
                stride: 1,
                activate_before_residual: false,
            });
        }
    }
    specs
}

/// WRN-28-w classifier. Forward returns `(features, logits)` where
/// `features` is the globally pooled (and optionally tanh-squashed)
/// 64w-dimensional vector consumed by the adversarial heads.
pub struct WideResNet {
    init_conv: Conv2d,
    units: Vec<ResidualUnit>,
    bn_out: BatchNorm2d,
    head: Linear,
    tanh_features: bool,
    slope: f64,
    feature_dim: usize,
}

impl WideResNet {
    pub fn new(config: &DomainAdaptConfig, vb: VarBuilder) -> Result<Self> {
        let init_conv = conv3x3(config.in_channels, 16, 1, vb.pp("init_conv"))?;

        let specs = unit_specs(config.width);
        let mut units = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            units.push(ResidualUnit::new(
                spec.in_c,
                spec.out_c,
                spec.stride,
                spec.activate_before_residual,
                config,
                vb.pp(format!("units.{i}")),
            )?);
        }

        let feature_dim = config.feature_dim();
        let bn_out = BatchNorm2d::new(feature_dim, config, vb.pp("bn_out"))?;
        let head = linear_xavier(feature_dim, config.num_classes, vb.pp("cls"))?;

        Ok(Self {
            init_conv,
            units,
            bn_out,
            head,
            tanh_features: config.tanh_features,
            slope: config.leaky_slope,
            feature_dim,
        })
    }

    /// Dimension of the pooled feature vector.
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let mut h = self.init_conv.forward(x)?;
        for unit in &self.units {
            h = unit.forward_t(&h, train)?;
        }
        let h = leaky_relu(&self.bn_out.forward_t(&h, train)?, self.slope)?;

        // Global average pool over the spatial dims.
        let features = h.mean(D::Minus1)?.mean(D::Minus1)?;
        let features = if self.tanh_features {
            features.tanh()?
        } else {
            features
        };
        let logits = self.head.forward(&features)?;
        Ok((features, logits))
    }

    /// Flip the frozen-statistics switch on every batch norm in the net.
    pub fn set_update_batch_stats(&self, flag: bool) {
        for unit in &self.units {
            unit.set_update_batch_stats(flag);
        }
        self.bn_out.set_update_batch_stats(flag);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
