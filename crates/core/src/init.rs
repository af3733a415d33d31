//! Weight-initialisation schemes, resolved once at layer construction.
//!
//! Each layer kind names its scheme explicitly when it is built, instead of
//! a post-hoc walk that inspects runtime type names. The scheme resolves to
//! a `candle_nn::Init` hint that `VarBuilder::get_with_hints` applies when
//! the variable is first created.

use candle_core::Result;
use candle_nn::init::{FanInOut, Init, NonLinearity, NormalOrUniform};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};

/// Initialisation scheme for a layer's weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitScheme {
    /// Kaiming normal, fan-out, ReLU gain. Classifier convolutions.
    KaimingNormalFanOut,
    /// Kaiming uniform, fan-in, ReLU gain.
    KaimingUniform,
    /// Xavier normal: `N(0, 2 / (fan_in + fan_out))`. Linear layers.
    XavierNormal,
    /// `N(0, 0.02)`. Generator convolutions (DCGAN convention).
    DcganNormal,
    /// Constant 1.
    One,
    /// Constant 0. Biases.
    Zero,
}

impl InitScheme {
    /// Resolve to a concrete `Init` hint. `fan_in`/`fan_out` are the number
    /// of input/output connections per unit (receptive-field elements
    /// included for convolutions); only Xavier consumes them here — Kaiming
    /// fans are derived from the tensor shape by candle itself.
    pub fn resolve(self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            Self::KaimingNormalFanOut => Init::Kaiming {
                dist: NormalOrUniform::Normal,
                fan: FanInOut::FanOut,
                non_linearity: NonLinearity::ReLU,
            },
            Self::KaimingUniform => Init::Kaiming {
                dist: NormalOrUniform::Uniform,
                fan: FanInOut::FanIn,
                non_linearity: NonLinearity::ReLU,
            },
            Self::XavierNormal => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (fan_in + fan_out) as f64).sqrt(),
            },
            Self::DcganNormal => Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
            Self::One => Init::Const(1.0),
            Self::Zero => Init::Const(0.0),
        }
    }
}

// ── Layer constructors ──────────────────────────────────────────────────────

/// Conv2d with an explicit initialisation scheme. `bias = false` matches the
/// classifier blocks (batch norm follows every convolution there).
pub fn conv2d_with(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    cfg: Conv2dConfig,
    scheme: InitScheme,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let fan_in = in_c * kernel * kernel;
    let fan_out = out_c * kernel * kernel;
    let ws = vb.get_with_hints(
        (out_c, in_c, kernel, kernel),
        "weight",
        scheme.resolve(fan_in, fan_out),
    )?;
    let bs = if bias {
        Some(vb.get_with_hints(out_c, "bias", InitScheme::Zero.resolve(fan_in, fan_out))?)
    } else {
        None
    };
    Ok(Conv2d::new(ws, bs, cfg))
}

/// Linear layer with Xavier-normal weights and zero bias, the head/MLP
/// convention throughout these nets.
pub fn linear_xavier(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        InitScheme::XavierNormal.resolve(in_dim, out_dim),
    )?;
    let bs = vb.get_with_hints(out_dim, "bias", InitScheme::Zero.resolve(in_dim, out_dim))?;
    Ok(Linear::new(ws, Some(bs)))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xavier_std_from_fans() {
        match InitScheme::XavierNormal.resolve(128, 1024) {
            Init::Randn { mean, stdev } => {
                assert_eq!(mean, 0.0);
                let expected = (2.0f64 / (128.0 + 1024.0)).sqrt();
                assert!((stdev - expected).abs() < 1e-12);
            }
            other => panic!("unexpected init: {other:?}"),
        }
    }

    #[test]
    fn dcgan_std_is_fixed() {
        match InitScheme::DcganNormal.resolve(3, 64) {
            Init::Randn { mean, stdev } => {
                assert_eq!(mean, 0.0);
                assert!((stdev - 0.02).abs() < 1e-12);
            }
            other => panic!("unexpected init: {other:?}"),
        }
    }

    #[test]
    fn kaiming_variants_keep_their_fans() {
        assert!(matches!(
            InitScheme::KaimingNormalFanOut.resolve(9, 9),
            Init::Kaiming {
                dist: NormalOrUniform::Normal,
                fan: FanInOut::FanOut,
                ..
            }
        ));
        assert!(matches!(
            InitScheme::KaimingUniform.resolve(9, 9),
            Init::Kaiming {
                dist: NormalOrUniform::Uniform,
                fan: FanInOut::FanIn,
                ..
            }
        ));
    }

    #[test]
    fn constants_resolve_to_const() {
        assert!(matches!(InitScheme::One.resolve(1, 1), Init::Const(c) if c == 1.0));
        assert!(matches!(InitScheme::Zero.resolve(1, 1), Init::Const(c) if c == 0.0));
    }
}
