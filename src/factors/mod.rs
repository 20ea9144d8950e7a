//! Measurement factors.
//!
//! A factor is a probabilistic constraint over one or more variables. It computes a
//! residual `r(x)` in the measurement's tangent space together with one Jacobian block per
//! connected key, and carries the noise model that whitens both:
//!
//! ```text
//! error(x) = 0.5 · ‖R · r(x)‖²          (Gaussian noise)
//! error(x) = 0.5 · ρ(‖R · r(x)‖²)       (robust noise)
//! ```
//!
//! Jacobians are taken w.r.t. right perturbations `x ⊞ δ`, i.e. in each variable's local
//! tangent coordinates.
//!
//! # Provided factors
//!
//! - [`PriorFactor`]: unary constraint `Log(measured⁻¹ ∘ x)`
//! - [`BetweenFactor`]: relative constraint `Log(measured⁻¹ ∘ x₁⁻¹ ∘ x₂)`
//!
//! Both are generic over every [`VariableValue`](crate::core::values::VariableValue)
//! (`SE2`, `SO2`, `Rn`).
//!
//! # Custom factors
//!
//! Only [`Factor::evaluate`] and the accessors need to be written; whitening, error and
//! linearization come from the provided methods.
//!
//! ```
//! use std::sync::Arc;
//! use nalgebra::{DMatrix, DVector};
//! use sextant::core::{CoreResult, key::Key, values::Values};
//! use sextant::core::noise_model::{IsotropicNoiseModel, NoiseModel};
//! use sextant::factors::Factor;
//! use sextant::manifold::se2::SE2;
//!
//! /// Range from the origin to a pose's position.
//! struct RangeFactor {
//!     keys: [Key; 1],
//!     range: f64,
//!     noise: Arc<dyn NoiseModel>,
//! }
//!
//! impl Factor for RangeFactor {
//!     fn keys(&self) -> &[Key] {
//!         &self.keys
//!     }
//!
//!     fn dim(&self) -> usize {
//!         1
//!     }
//!
//!     fn noise_model(&self) -> &Arc<dyn NoiseModel> {
//!         &self.noise
//!     }
//!
//!     fn evaluate(
//!         &self,
//!         values: &Values,
//!         compute_jacobians: bool,
//!     ) -> CoreResult<(DVector<f64>, Option<Vec<DMatrix<f64>>>)> {
//!         let pose = values.get::<SE2>(self.keys[0])?;
//!         let predicted = pose.translation().norm();
//!         let residual = DVector::from_element(1, predicted - self.range);
//!         // d‖t‖/dδ with t ⊞ δ = t + R·δ_xy
//!         let jacobians = compute_jacobians.then(|| {
//!             let g = pose.rotation_matrix().transpose() * pose.translation() / predicted;
//!             vec![DMatrix::from_row_slice(1, 3, &[g.x, g.y, 0.0])]
//!         });
//!         Ok((residual, jacobians))
//!     }
//! }
//!
//! # fn example() -> sextant::error::SextantResult<()> {
//! let factor = RangeFactor {
//!     keys: [1],
//!     range: 5.0,
//!     noise: IsotropicNoiseModel::from_sigma(1, 0.5)?.into_shared(),
//! };
//! let mut values = Values::new();
//! values.insert(1, SE2::from_xy_angle(3.0, 4.0, 0.3))?;
//! assert!(factor.error(&values)?.abs() < 1e-12);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::core::{
    CoreError, CoreResult,
    key::{Key, format_key},
    noise_model::NoiseModel,
    values::{Values, VariableValue},
};
use crate::manifold::LieGroup;

pub mod between_factor;
pub mod prior_factor;

pub use between_factor::BetweenFactor;
pub use prior_factor::PriorFactor;

/// Whitened linearization of one factor: `A_k` blocks per key and `b = -r`.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    pub keys: Vec<Key>,
    /// Whitened Jacobian blocks, one per key, each `dim × tangent_dim(key)`.
    pub jacobians: Vec<DMatrix<f64>>,
    pub residual: DVector<f64>,
}

impl JacobianFactor {
    pub fn dim(&self) -> usize {
        self.residual.len()
    }

    /// `0.5 · ‖r‖²` of the (possibly reweighted) whitened residual.
    pub fn error(&self) -> f64 {
        0.5 * self.residual.norm_squared()
    }
}

/// A measurement constraint in a factor graph.
///
/// Factors are immutable once constructed and are evaluated concurrently, hence
/// `Send + Sync`.
pub trait Factor: Send + Sync {
    /// Connected variables, in the order Jacobian blocks are returned.
    fn keys(&self) -> &[Key];

    /// Residual dimension.
    fn dim(&self) -> usize;

    fn noise_model(&self) -> &Arc<dyn NoiseModel>;

    /// Unwhitened residual and, if requested, one Jacobian block per key.
    fn evaluate(
        &self,
        values: &Values,
        compute_jacobians: bool,
    ) -> CoreResult<(DVector<f64>, Option<Vec<DMatrix<f64>>>)>;

    fn unwhitened_error(&self, values: &Values) -> CoreResult<DVector<f64>> {
        Ok(self.evaluate(values, false)?.0)
    }

    fn whitened_error(&self, values: &Values) -> CoreResult<DVector<f64>> {
        self.noise_model().whiten(&self.unwhitened_error(values)?)
    }

    /// Contribution of this factor to the graph error.
    fn error(&self, values: &Values) -> CoreResult<f64> {
        let residual = self.unwhitened_error(values)?;
        let noise = self.noise_model();
        Ok(noise.loss(noise.squared_mahalanobis_distance(&residual)?))
    }

    fn linearize(&self, values: &Values) -> CoreResult<JacobianFactor> {
        let (residual, jacobians) = self.evaluate(values, true)?;
        let jacobians = jacobians.ok_or_else(|| {
            CoreError::FactorLinearization(format!(
                "factor on [{}] returned no Jacobians",
                describe_keys(self.keys())
            ))
        })?;
        if jacobians.len() != self.keys().len() {
            return Err(CoreError::FactorLinearization(format!(
                "factor on [{}] returned {} Jacobian blocks for {} keys",
                describe_keys(self.keys()),
                jacobians.len(),
                self.keys().len()
            )));
        }

        let noise = self.noise_model();
        let mut whitened_residual = noise.whiten(&residual)?;
        let mut whitened_jacobians = jacobians
            .iter()
            .map(|j| noise.whiten_jacobian(j))
            .collect::<CoreResult<Vec<_>>>()?;
        noise.robustify(&mut whitened_residual, &mut whitened_jacobians);

        Ok(JacobianFactor {
            keys: self.keys().to_vec(),
            jacobians: whitened_jacobians,
            residual: whitened_residual,
        })
    }

    /// One-line description used when printing a graph.
    fn describe(&self) -> String {
        format!(
            "Factor on [{}], {}",
            describe_keys(self.keys()),
            self.noise_model().describe()
        )
    }
}

pub(crate) fn describe_keys(keys: &[Key]) -> String {
    keys.iter().map(format_key).collect::<Vec<_>>().join(", ")
}

/// Checks that a noise model matches the tangent dimension of a measurement.
pub(crate) fn check_noise_dim<T: LieGroup>(
    measured: &T,
    noise: &Arc<dyn NoiseModel>,
) -> CoreResult<()> {
    if noise.dim() == measured.tangent_dim() {
        Ok(())
    } else {
        Err(CoreError::dimension_mismatch(
            "noise model dimension",
            measured.tangent_dim(),
            noise.dim(),
        ))
    }
}

/// Typed lookup that also checks the runtime dimension (relevant for `Rn`).
pub(crate) fn lookup<'a, T: VariableValue>(
    values: &'a Values,
    key: Key,
    expected_dim: usize,
) -> CoreResult<&'a T> {
    let value = values.get::<T>(key)?;
    if value.tangent_dim() != expected_dim {
        return Err(CoreError::dimension_mismatch(
            format!("variable {}", format_key(key)),
            expected_dim,
            value.tangent_dim(),
        ));
    }
    Ok(value)
}
