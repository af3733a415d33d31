//! Feature-space translation generators (CycleGAN-style).
//!
//! The cross-domain experiments translate images into a small shared
//! feature plane and back: [`FeatureEncoder`] downsamples an image into a
//! flat feature vector, [`FeatureDecoder`] reshapes such a vector and
//! upsamples it back into image space. Instance normalisation (per sample,
//! per channel, no affine) keeps translation statistics independent across
//! batch members.

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::init::{conv2d_with, InitScheme};

const IN_EPS: f64 = 1e-5;

/// Per-sample, per-channel normalisation over the spatial dims. No affine
/// parameters.
pub fn instance_norm(x: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(2)?.mean_keepdim(3)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?.mean_keepdim(3)?;
    let denom = (var + eps)?.sqrt()?;
    centered.broadcast_div(&denom)
}

fn gen_conv(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    conv2d_with(in_c, out_c, kernel, cfg, InitScheme::DcganNormal, true, vb)
}

// ── Residual block ──────────────────────────────────────────────────────────

/// Channel-preserving residual block: two 3×3 convolutions with instance
/// norm and ReLU, added back to the input.
pub struct GenResidualBlock {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl GenResidualBlock {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: gen_conv(channels, channels, 3, 1, 1, vb.pp("conv1"))?,
            conv2: gen_conv(channels, channels, 3, 1, 1, vb.pp("conv2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = instance_norm(&self.conv1.forward(x)?, IN_EPS)?.relu()?;
        let h = instance_norm(&self.conv2.forward(&h)?, IN_EPS)?.relu()?;
        x + h
    }
}

// ── Encoder ─────────────────────────────────────────────────────────────────

/// Image → flat feature vector.
///
/// 7×7 stem, two stride-2 downsampling stages (channels double each time),
/// then `n_blocks` residual blocks, flattened to `(batch, c·h·w)`.
pub struct FeatureEncoder {
    stem: Conv2d,
    down1: Conv2d,
    down2: Conv2d,
    blocks: Vec<GenResidualBlock>,
}

impl FeatureEncoder {
    /// `base_features` is the stem's output channel count; the two
    /// downsampling stages produce `2·base` and `4·base` channels.
    pub fn new(
        in_channels: usize,
        base_features: usize,
        n_blocks: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stem = gen_conv(in_channels, base_features, 7, 1, 3, vb.pp("stem"))?;
        let down1 = gen_conv(base_features, 2 * base_features, 3, 2, 1, vb.pp("down1"))?;
        let down2 = gen_conv(2 * base_features, 4 * base_features, 3, 2, 1, vb.pp("down2"))?;
        let mut blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            blocks.push(GenResidualBlock::new(
                4 * base_features,
                vb.pp(format!("blocks.{i}")),
            )?);
        }
        Ok(Self {
            stem,
            down1,
            down2,
            blocks,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = instance_norm(&self.stem.forward(x)?, IN_EPS)?.relu()?;
        let h = instance_norm(&self.down1.forward(&h)?, IN_EPS)?.relu()?;
        let mut h = instance_norm(&self.down2.forward(&h)?, IN_EPS)?.relu()?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        h.flatten_from(1)
    }
}

// ── Decoder ─────────────────────────────────────────────────────────────────

/// Flat feature vector → image.
///
/// Reshapes to `plane_shape`, applies two nearest-upsample + conv stages
/// (channels halve from `hidden_features` each time), then a 7×7 output
/// convolution with tanh.
pub struct FeatureDecoder {
    up1: Conv2d,
    up2: Conv2d,
    out_conv: Conv2d,
    plane_shape: (usize, usize, usize),
}

impl FeatureDecoder {
    /// `plane_shape` is the `(channels, height, width)` the incoming flat
    /// vector is reshaped to.
    pub fn new(
        out_channels: usize,
        plane_shape: (usize, usize, usize),
        hidden_features: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let f1 = hidden_features / 2;
        let f2 = hidden_features / 4;
        let up1 = gen_conv(plane_shape.0, f1, 3, 1, 1, vb.pp("up1"))?;
        let up2 = gen_conv(f1, f2, 3, 1, 1, vb.pp("up2"))?;
        let out_conv = gen_conv(f2, out_channels, 7, 1, 3, vb.pp("out_conv"))?;
        Ok(Self {
            up1,
            up2,
            out_conv,
            plane_shape,
        })
    }

    fn upsample2x(x: &Tensor) -> Result<Tensor> {
        let (_n, _c, h, w) = x.dims4()?;
        x.upsample_nearest2d(2 * h, 2 * w)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let (c, h, w) = self.plane_shape;
        let mut h_t = x.reshape((batch, c, h, w))?;
        for conv in [&self.up1, &self.up2] {
            h_t = Self::upsample2x(&h_t)?;
            h_t = instance_norm(&conv.forward(&h_t)?, IN_EPS)?.relu()?;
        }
        self.out_conv.forward(&h_t)?.tanh()
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
    fn instance_norm_zero_mean_per_sample() {
        let dev = Device::Cpu;
        let x = Tensor::randn(5f32, 3f32, (2, 3, 6, 6), &dev).unwrap();
        let y = instance_norm(&x, IN_EPS).unwrap();
        for n in 0..2 {
            for c in 0..3 {
                let vals: Vec<f32> = y
                    .narrow(0, n, 1)
                    .unwrap()
                    .narrow(1, c, 1)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1()
                    .unwrap();
                let mean = vals.iter().sum::<f32>() / vals.len() as f32;
                assert!(mean.abs() < 1e-4, "sample {n} channel {c} mean {mean}");
            }
        }
    }

    #[test]
    fn encoder_flattens_downsampled_plane() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let enc = FeatureEncoder::new(3, 1, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &dev).unwrap();
        let y = enc.forward(&x).unwrap();
        // 32×32 → two stride-2 stages → 4 channels × 8 × 8.
        assert_eq!(y.dims(), &[2, 4 * 8 * 8]);
    }

    #[test]
    fn residual_block_preserves_shape() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let block = GenResidualBlock::new(4, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &dev).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn decoder_round_trip_shape() {
        let dev = Device::Cpu;
        let (_varmap, vb) = vb();
        let dec = FeatureDecoder::new(3, (2, 8, 8), 256, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 2 * 8 * 8), &dev).unwrap();
        let y = dec.forward(&x).unwrap();
        // Two 2× upsamples: 8 → 32.
        assert_eq!(y.dims(), &[2, 3, 32, 32]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
