//! Batch normalisation with an explicit frozen-statistics switch.
//!
//! Semi-supervised and domain-adaptation training needs to run unlabelled
//! or perturbed batches through the classifier *without* polluting the
//! running statistics. Rather than inferring this from an ambient
//! train/eval mode, every [`BatchNorm2d`] carries its own
//! `update_batch_stats` flag:
//!
//! * **true** — standard batch norm: batch statistics (and a running-stats
//!   update) in training, running statistics in evaluation.
//! * **false** — normalise with the current batch's statistics in both
//!   modes and never touch the running buffers.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};

use dann_common::DomainAdaptConfig;

/// 2-D batch norm over (N, C, H, W) with a per-module frozen-stats flag.
pub struct BatchNorm2d {
    inner: BatchNorm,
    channels: usize,
    eps: f64,
    // Single-writer; atomic only so the flag can flip through `&self` while
    // the module sits inside a shared model tree.
    update_batch_stats: AtomicBool,
}

impl BatchNorm2d {
    pub fn new(channels: usize, config: &DomainAdaptConfig, vb: VarBuilder) -> Result<Self> {
        let bn_config = BatchNormConfig {
            eps: config.bn_eps,
            remove_mean: true,
            affine: true,
            momentum: config.bn_momentum,
        };
        let inner = batch_norm(channels, bn_config, vb)?;
        Ok(Self {
            inner,
            channels,
            eps: config.bn_eps,
            update_batch_stats: AtomicBool::new(config.update_batch_stats),
        })
    }

    /// Flip the frozen-statistics switch.
    pub fn set_update_batch_stats(&self, flag: bool) {
        self.update_batch_stats.store(flag, Ordering::Relaxed);
    }

    pub fn update_batch_stats(&self) -> bool {
        self.update_batch_stats.load(Ordering::Relaxed)
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if self.update_batch_stats() {
            self.inner.forward_t(x, train)
        } else {
            self.batch_stats_only(x)
        }
    }

    /// Normalise with the current batch's statistics; running buffers stay
    /// untouched. Gradients flow through the statistics as in training-mode
    /// batch norm.
    fn batch_stats_only(&self, x: &Tensor) -> Result<Tensor> {
        let (_n, c, _h, _w) = x.dims4()?;
        if c != self.channels {
            candle_core::bail!(
                "batch norm expects {} channels, got {c}",
                self.channels
            );
        }
        let mean = x.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered
            .sqr()?
            .mean_keepdim(0)?
            .mean_keepdim(2)?
            .mean_keepdim(3)?;
        let denom = (var + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&denom)?;
        match self.inner.weight_and_bias() {
            Some((weight, bias)) => {
                let weight = weight.reshape((1, c, 1, 1))?;
                let bias = bias.reshape((1, c, 1, 1))?;
                normed.broadcast_mul(&weight)?.broadcast_add(&bias)
            }
            None => Ok(normed),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn fresh_bn(channels: usize, update: bool) -> BatchNorm2d {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = DomainAdaptConfig {
            update_batch_stats: update,
            ..DomainAdaptConfig::default()
        };
        BatchNorm2d::new(channels, &config, vb).unwrap()
    }

    fn channel_moments(y: &Tensor, channel: usize) -> (f32, f32) {
        let vals: Vec<f32> = y
            .narrow(1, channel, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let n = vals.len() as f32;
        let mean = vals.iter().sum::<f32>() / n;
        let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        (mean, var)
    }

    #[test]
    fn frozen_path_normalises_with_batch_stats() {
        let dev = Device::Cpu;
        let bn = fresh_bn(3, false);
        let x = Tensor::randn(2f32, 5f32, (4, 3, 8, 8), &dev).unwrap();

        // Frozen flag applies in eval mode too.
        let y = bn.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), x.dims());
        for c in 0..3 {
            let (mean, var) = channel_moments(&y, c);
            assert!(mean.abs() < 1e-4, "channel {c} mean {mean}");
            assert!((var - 1.0).abs() < 2e-2, "channel {c} var {var}");
        }
    }

    #[test]
    fn eval_mode_uses_running_stats_when_updating() {
        let dev = Device::Cpu;
        let bn = fresh_bn(2, true);
        let x = Tensor::randn(3f32, 2f32, (4, 2, 4, 4), &dev).unwrap();

        // Fresh running stats are mean 0 / var 1, so eval-mode output is
        // x / sqrt(1 + eps).
        let y = bn.forward_t(&x, false).unwrap();
        let expected = x.affine(1.0 / (1.0f64 + 1e-3).sqrt(), 0.0).unwrap();
        let got: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = expected.flatten_all().unwrap().to_vec1().unwrap();
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1e-5, "got {g}, want {w}");
        }
    }

    #[test]
    fn frozen_path_leaves_running_buffers_untouched() {
        let dev = Device::Cpu;
        let bn = fresh_bn(2, false);
        // Off-centre batch: any running-stats update would be visible.
        let x = Tensor::randn(10f32, 1f32, (4, 2, 4, 4), &dev).unwrap();

        bn.forward_t(&x, true).unwrap();
        bn.forward_t(&x, false).unwrap();

        let mean: Vec<f32> = bn.inner.running_mean().to_vec1().unwrap();
        let var: Vec<f32> = bn.inner.running_var().to_vec1().unwrap();
        assert!(mean.iter().all(|&m| m == 0.0), "running mean moved: {mean:?}");
        assert!(var.iter().all(|&v| v == 1.0), "running var moved: {var:?}");

        // Control: the same batch through an updating module does move
        // the buffer.
        let bn = fresh_bn(2, true);
        bn.forward_t(&x, true).unwrap();
        let mean: Vec<f32> = bn.inner.running_mean().to_vec1().unwrap();
        assert!(mean.iter().any(|&m| m != 0.0));
    }

    #[test]
    fn flag_flips_behaviour() {
        let dev = Device::Cpu;
        let bn = fresh_bn(2, true);
        assert!(bn.update_batch_stats());
        bn.set_update_batch_stats(false);
        assert!(!bn.update_batch_stats());

        // With the flag off, even an off-centre batch comes out normalised.
        let x = Tensor::randn(10f32, 1f32, (8, 2, 4, 4), &dev).unwrap();
        let y = bn.forward_t(&x, false).unwrap();
        let (mean, _) = channel_moments(&y, 0);
        assert!(mean.abs() < 1e-4);
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let dev = Device::Cpu;
        let bn = fresh_bn(3, false);
        let x = Tensor::zeros((2, 4, 4, 4), DType::F32, &dev).unwrap();
        assert!(bn.forward_t(&x, true).is_err());
    }
}
