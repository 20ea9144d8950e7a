//! Triggs correction: robust loss as reweighted least squares.
//!
//! Given a whitened residual `r`, `s = ‖r‖²` and a loss with derivatives `ρ'`, `ρ''`, the
//! corrected residual `r̃` and Jacobian `J̃` make the Gauss-Newton model of `‖r̃‖²` match the
//! second-order model of `ρ(s)`:
//!
//! ```text
//! α  = 1 - √(1 + 2 s ρ''/ρ')
//! r̃  = √ρ' / (1 - α) · r
//! J̃  = √ρ' · (J - α/s · r rᵀ J)
//! ```
//!
//! The curvature term is only used when `ρ'' > 0`. The usual robust losses have `ρ'' ≤ 0`
//! and are corrected by the `√ρ'` scaling alone.
//!
//! Reference: Triggs et al., "Bundle Adjustment: A Modern Synthesis" (1999), section 4.3,
//! and the corrector in Ceres Solver.

use nalgebra::{DMatrix, DVector};

use crate::core::loss_functions::LossFunction;

/// Precomputed scaling factors for one residual block at one linearization point.
#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho_1, rho_2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho_1.max(0.0).sqrt();

        if sq_norm == 0.0 || rho_2 <= 0.0 || rho_1 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // Root of 0.5·α² - α - (ρ''/ρ')·s = 0.
        let d = 1.0 + 2.0 * sq_norm * rho_2 / rho_1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// `J ← √ρ' · (J - α/s · r rᵀ J)`, in place.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }

        let rt_j = residual.transpose() * &*jacobian;
        let correction = residual * rt_j * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }

    /// `r ← √ρ' / (1 - α) · r`, in place.
    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}
