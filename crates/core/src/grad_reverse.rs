//! Gradient reversal: identity on the forward pass, `-coeff · grad` on the
//! backward pass.
//!
//! This is the mechanism that makes domain-adversarial training work: the
//! discriminator is trained to tell domains apart, while the reversed
//! gradient pushes the feature extractor to make them indistinguishable.
//! The reversal strength ramps up over training along a saturating sigmoid
//! ([`GrlSchedule`]) so that early, noisy discriminator gradients do not
//! destabilise the feature extractor.
//!
//! Two equivalent formulations are provided:
//!
//! | Form | Entry point | Mechanism |
//! |------|-------------|-----------|
//! | Custom op | [`reverse_grad`] | [`CustomOp1`] with an explicit backward rule |
//! | Detach residual | [`reverse_grad_residual`] | `x.detach() + (x - x.detach()) · (-coeff)` |
//!
//! Both produce bit-identical forward values and gradients; the residual
//! form exists for graphs where a custom op is inconvenient (it composes
//! from primitive ops only). [`GradReverseLayer`] wraps either form together
//! with the step counter and warm-up handling.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{CpuStorage, CustomOp1, Layout, Result, Shape, Tensor};

use dann_common::GrlParams;

// ── Coefficient schedule ────────────────────────────────────────────────────

/// Exponent floor. `exp` underflows to 0 well before this, so the schedule
/// saturates at `high` instead of degrading for steps far beyond `max_iter`.
const EXP_FLOOR: f64 = -700.0;

/// Saturating sigmoid ramp from `low` to `high`:
///
/// ```text
/// coeff(step) = 2(high-low) / (1 + exp(-alpha · step / max_iter)) - (high-low) + low
/// ```
///
/// Pure in `step`: the step counter lives in the calling module, not here.
/// `coeff(0) == low`, `coeff(∞) → high`, monotone non-decreasing for
/// `alpha > 0`.
#[derive(Debug, Clone, Copy)]
pub struct GrlSchedule {
    low: f64,
    high: f64,
    alpha: f64,
    max_iter: f64,
}

impl GrlSchedule {
    /// Construct a schedule, rejecting parameters that would produce NaN or
    /// Inf coefficients during training.
    pub fn new(low: f64, high: f64, alpha: f64, max_iter: f64) -> Result<Self> {
        if !low.is_finite() || !high.is_finite() {
            candle_core::bail!("grl schedule bounds must be finite (low={low}, high={high})");
        }
        if high < low {
            candle_core::bail!("grl schedule high ({high}) must be >= low ({low})");
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            candle_core::bail!("grl schedule alpha must be > 0, got {alpha}");
        }
        if !(max_iter.is_finite() && max_iter > 0.0) {
            candle_core::bail!("grl schedule max_iter must be > 0, got {max_iter}");
        }
        Ok(Self {
            low,
            high,
            alpha,
            max_iter,
        })
    }

    /// Construct from the serialisable parameter block (warm-up is handled
    /// by [`GradReverseLayer`], not the schedule).
    pub fn from_params(params: &GrlParams) -> Result<Self> {
        Self::new(params.low, params.high, params.alpha, params.max_iter)
    }

    /// Coefficient at `step`. Negative steps clamp to 0.
    pub fn coeff(&self, step: f64) -> f64 {
        let step = step.max(0.0);
        let span = self.high - self.low;
        let exponent = (-self.alpha * step / self.max_iter).max(EXP_FLOOR);
        2.0 * span / (1.0 + exponent.exp()) - span + self.low
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }
}

// ── Custom-op form ──────────────────────────────────────────────────────────

/// Identity forward, `-coeff · grad` backward.
///
/// "Multiply the gradient by a negative scalar" is not expressible as a
/// forward composition, so the backward rule is registered explicitly.
struct ReverseGrad {
    coeff: f64,
}

impl CustomOp1 for ReverseGrad {
    fn name(&self) -> &'static str {
        "reverse-grad"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let shape = layout.shape().clone();
        // Callers go through `reverse_grad`, which makes the input contiguous.
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle_core::bail!("reverse-grad expects a contiguous input"),
        };
        match storage {
            CpuStorage::F32(vs) => Ok((CpuStorage::F32(vs[start..end].to_vec()), shape)),
            CpuStorage::F64(vs) => Ok((CpuStorage::F64(vs[start..end].to_vec()), shape)),
            _ => candle_core::bail!("reverse-grad only supports f32/f64 tensors"),
        }
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        Ok(Some(grad_res.affine(-self.coeff, 0.0)?))
    }
}

/// Apply gradient reversal via the custom-op form.
///
/// Forward output equals the input exactly; the backward pass replaces the
/// upstream gradient `g` with `-coeff · g`.
pub fn reverse_grad(x: &Tensor, coeff: f64) -> Result<Tensor> {
    x.contiguous()?.apply_op1(ReverseGrad { coeff })
}

// ── Detach-residual form ────────────────────────────────────────────────────

/// Apply gradient reversal via detach-residual algebra.
///
/// `(x - x.detach())` is exactly zero in the forward pass, so the output
/// equals the input; in the backward pass the detached term contributes no
/// gradient and the residual contributes `-coeff` per element. The gradient
/// computation (`grad.affine(-coeff, 0)`) is the same as the custom op's
/// backward rule, so the two forms are bit-identical.
pub fn reverse_grad_residual(x: &Tensor, coeff: f64) -> Result<Tensor> {
    let detached = x.detach();
    let residual = (x - &detached)?;
    &detached + &residual.affine(-coeff, 0.0)?
}

// ── Layer ───────────────────────────────────────────────────────────────────

/// Which reversal formulation a [`GradReverseLayer`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrlForm {
    /// Explicit [`CustomOp1`] backward rule.
    CustomOp,
    /// Detach-residual composition of primitive ops.
    Residual,
}

/// Gradient-reversal layer with a scheduled, warm-up-gated coefficient.
///
/// Owns a per-instance step counter that advances once per training-mode
/// forward call and never in evaluation mode. The coefficient for a forward
/// call is computed from the counter *before* it is incremented:
///
/// * `counter < warmup_steps` → coefficient is exactly 0 (no reversal).
/// * otherwise → `schedule.coeff(counter - warmup_steps)`.
///
/// The counter is monotone; resetting requires re-instantiating the layer.
/// Single-writer per instance: the atomic exists only so `forward_t` can
/// take `&self`.
pub struct GradReverseLayer {
    schedule: GrlSchedule,
    warmup_steps: u64,
    step: AtomicU64,
    form: GrlForm,
}

impl GradReverseLayer {
    /// Custom-op form with the given ramp parameters.
    pub fn new(params: &GrlParams) -> Result<Self> {
        Self::with_form(params, GrlForm::CustomOp)
    }

    /// Choose the reversal formulation explicitly.
    pub fn with_form(params: &GrlParams, form: GrlForm) -> Result<Self> {
        let schedule = GrlSchedule::from_params(params)?;
        Ok(Self {
            schedule,
            warmup_steps: params.warmup_steps,
            step: AtomicU64::new(0),
            form,
        })
    }

    /// Current step counter value.
    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    /// Coefficient that the next forward call will use.
    pub fn coeff(&self) -> f64 {
        self.coeff_at(self.step())
    }

    fn coeff_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            0.0
        } else {
            self.schedule.coeff((step - self.warmup_steps) as f64)
        }
    }

    /// Identity forward; schedules `-coeff · grad` for the backward pass.
    /// Advances the step counter iff `train`.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let step = self.step.load(Ordering::Relaxed);
        let coeff = self.coeff_at(step);
        if train {
            self.step.fetch_add(1, Ordering::Relaxed);
        }
        match self.form {
            GrlForm::CustomOp => reverse_grad(x, coeff),
            GrlForm::Residual => reverse_grad_residual(x, coeff),
        }
    }
}

impl candle_nn::ModuleT for GradReverseLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(xs, train)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
