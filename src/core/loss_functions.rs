//! Robust M-estimators for outlier-tolerant least squares.
//!
//! Every loss is a function ρ(s) of the squared whitened residual norm `s = ‖r‖²`,
//! normalized so that ρ(s) ≈ s near zero (ρ(0) = 0, ρ'(0) = 1). A robust noise model
//! contributes `0.5·ρ(s)` to the graph error, matching `0.5·s` for the plain Gaussian case.
//!
//! `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]`; the [`Corrector`](crate::core::corrector::Corrector)
//! turns the derivatives into reweighted residuals and Jacobians.
//!
//! | Loss | ρ(s) for inliers | behaviour for outliers |
//! |------|------------------|------------------------|
//! | [`HuberLoss`] | `s` | linear growth |
//! | [`CauchyLoss`] | `δ² log(1 + s/δ²)` | logarithmic growth |
//! | [`WelschLoss`] | `δ² (1 - exp(-s/δ²))` | saturates at `δ²` |
//! | [`TukeyBiweightLoss`] | `δ²/3 (1 - (1 - s/δ²)³)` | constant `δ²/3` beyond `δ` |

use std::fmt::Debug;

use crate::core::{CoreError, CoreResult};

/// A robust loss ρ(s) with its first two derivatives.
pub trait LossFunction: Send + Sync + Debug {
    /// `[ρ(s), ρ'(s), ρ''(s)]` at squared residual norm `s ≥ 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];

    fn name(&self) -> &'static str;
}

fn check_scale(name: &str, scale: f64) -> CoreResult<f64> {
    if scale > 0.0 && scale.is_finite() {
        Ok(scale)
    } else {
        Err(CoreError::InvalidNoiseModel(format!(
            "{name} scale must be positive and finite, got {scale}"
        )))
    }
}

/// Huber loss: quadratic below `δ`, linear above.
///
/// ```text
/// ρ(s) = s                 s ≤ δ²
/// ρ(s) = 2δ√s - δ²         s > δ²
/// ```
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    /// `scale` is the inlier threshold δ on the whitened residual norm; 1.345 gives 95%
    /// efficiency on Gaussian data.
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Huber", scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }

    fn name(&self) -> &'static str {
        "Huber"
    }
}

/// Cauchy (Lorentzian) loss.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Cauchy", scale)?;
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale2;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.inv_scale2 * inv * inv,
        ]
    }

    fn name(&self) -> &'static str {
        "Cauchy"
    }
}

/// Welsch (Leclerc) loss; weights decay as `exp(-s/δ²)`.
#[derive(Debug, Clone)]
pub struct WelschLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl WelschLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Welsch", scale)?;
        let scale2 = scale * scale;
        Ok(WelschLoss {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl LossFunction for WelschLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let exp_term = (-s * self.inv_scale2).exp();
        [
            self.scale2 * (1.0 - exp_term),
            exp_term,
            -self.inv_scale2 * exp_term,
        ]
    }

    fn name(&self) -> &'static str {
        "Welsch"
    }
}

/// Tukey biweight loss. Residuals beyond `δ` get zero weight.
#[derive(Debug, Clone)]
pub struct TukeyBiweightLoss {
    scale2: f64,
}

impl TukeyBiweightLoss {
    /// 4.6851 gives 95% efficiency on Gaussian data.
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Tukey", scale)?;
        Ok(TukeyBiweightLoss {
            scale2: scale * scale,
        })
    }
}

impl LossFunction for TukeyBiweightLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            return [self.scale2 / 3.0, 0.0, 0.0];
        }
        let u = 1.0 - s / self.scale2;
        [
            self.scale2 / 3.0 * (1.0 - u * u * u),
            u * u,
            -2.0 * u / self.scale2,
        ]
    }

    fn name(&self) -> &'static str {
        "Tukey"
    }
}
