//! Wide-ResNet building blocks.

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use dann_common::DomainAdaptConfig;

use crate::init::{conv2d_with, InitScheme};
use crate::norm::BatchNorm2d;

/// LeakyReLU with the workspace-wide negative slope convention.
#[inline]
pub fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    candle_nn::ops::leaky_relu(x, slope)
}

/// 3×3 convolution, padding 1, no bias, Kaiming-normal fan-out init.
pub fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d_with(in_c, out_c, 3, cfg, InitScheme::KaimingNormalFanOut, false, vb)
}

/// 1×1 convolution, no padding, no bias. Shortcut projections.
pub fn conv1x1(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        stride,
        ..Default::default()
    };
    conv2d_with(in_c, out_c, 1, cfg, InitScheme::KaimingNormalFanOut, false, vb)
}

// ── Residual unit ───────────────────────────────────────────────────────────

/// Pre-activation WRN residual unit:
///
/// ```text
/// BN → LeakyReLU → conv3x3(stride) → BN → LeakyReLU → conv3x3
/// ```
///
/// A 1×1 strided convolution projects the skip connection whenever the
/// stride or channel count changes. With `activate_before_residual` the
/// first BN+activation is applied *before* the split, so the skip sees the
/// activated input (the first unit of the first group uses this).
pub struct ResidualUnit {
    bn1: BatchNorm2d,
    conv1: Conv2d,
    bn2: BatchNorm2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    activate_before_residual: bool,
    slope: f64,
}

impl ResidualUnit {
    pub fn new(
        in_c: usize,
        out_c: usize,
        stride: usize,
        activate_before_residual: bool,
        config: &DomainAdaptConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bn1 = BatchNorm2d::new(in_c, config, vb.pp("bn1"))?;
        let conv1 = conv3x3(in_c, out_c, stride, vb.pp("conv1"))?;
        let bn2 = BatchNorm2d::new(out_c, config, vb.pp("bn2"))?;
        let conv2 = conv3x3(out_c, out_c, 1, vb.pp("conv2"))?;
        let shortcut = if stride >= 2 || in_c != out_c {
            Some(conv1x1(in_c, out_c, stride, vb.pp("shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            bn1,
            conv1,
            bn2,
            conv2,
            shortcut,
            activate_before_residual,
            slope: config.leaky_slope,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let pre = leaky_relu(&self.bn1.forward_t(x, train)?, self.slope)?;
        let skip_in = if self.activate_before_residual {
            &pre
        } else {
            x
        };

        let h = self.conv1.forward(&pre)?;
        let h = leaky_relu(&self.bn2.forward_t(&h, train)?, self.slope)?;
        let h = self.conv2.forward(&h)?;

        let skip = match &self.shortcut {
            Some(proj) => proj.forward(skip_in)?,
            None => skip_in.clone(),
        };
        skip + h
    }

    /// Flip the frozen-statistics switch on both batch norms.
    pub fn set_update_batch_stats(&self, flag: bool) {
        self.bn1.set_update_batch_stats(flag);
        self.bn2.set_update_batch_stats(flag);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn unit(in_c: usize, out_c: usize, stride: usize, abr: bool) -> ResidualUnit {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = DomainAdaptConfig::default();
        ResidualUnit::new(in_c, out_c, stride, abr, &config, vb).unwrap()
    }

    #[test]
    fn identity_shape_when_channels_match() {
        let dev = Device::Cpu;
        let block = unit(16, 16, 1, false);
        let x = Tensor::randn(0f32, 1f32, (2, 16, 8, 8), &dev).unwrap();
        let y = block.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[2, 16, 8, 8]);
        assert!(block.shortcut.is_none());
    }

    #[test]
    fn strided_unit_downsamples_and_widens() {
        let dev = Device::Cpu;
        let block = unit(16, 32, 2, false);
        let x = Tensor::randn(0f32, 1f32, (2, 16, 8, 8), &dev).unwrap();
        let y = block.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[2, 32, 4, 4]);
        assert!(block.shortcut.is_some());
    }

    #[test]
    fn activate_before_residual_shape() {
        let dev = Device::Cpu;
        let block = unit(16, 32, 1, true);
        let x = Tensor::randn(0f32, 1f32, (1, 16, 4, 4), &dev).unwrap();
        let y = block.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[1, 32, 4, 4]);
    }
}
