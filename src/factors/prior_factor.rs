//! Prior factor for unary constraints on variables.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::{Factor, check_noise_dim, describe_keys, lookup};
use crate::core::{
    CoreResult,
    key::Key,
    noise_model::NoiseModel,
    values::{Values, VariableValue},
};
use crate::manifold::{Tangent, jacobian_to_dmatrix};

/// Prior factor (unary constraint) on a single variable.
///
/// Anchors a variable to a known value, e.g. the first pose of a trajectory, a GPS fix or
/// a regularizer that keeps a variable close to its initial guess.
///
/// # Mathematical Formulation
///
/// The residual is the manifold difference between the estimate and the prior:
///
/// ```text
/// r = Log(x_prior⁻¹ ∘ x)
/// J = Jr⁻¹(r)
/// ```
///
/// For `Rn` this reduces to `r = x - x_prior` and `J = I`.
///
/// # Example
///
/// ```
/// use sextant::core::{noise_model::{DiagonalNoiseModel, NoiseModel}, values::Values};
/// use sextant::factors::{Factor, PriorFactor};
/// use sextant::manifold::se2::SE2;
///
/// # fn example() -> sextant::error::SextantResult<()> {
/// let noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
/// let prior = PriorFactor::new(1, SE2::identity(), noise)?;
///
/// let mut values = Values::new();
/// values.insert(1, SE2::from_xy_angle(0.3, 0.0, 0.0))?;
///
/// // One sigma off in x.
/// assert!((prior.error(&values)? - 0.5).abs() < 1e-12);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct PriorFactor<T: VariableValue> {
    keys: [Key; 1],
    prior: T,
    noise: Arc<dyn NoiseModel>,
}

impl<T: VariableValue> PriorFactor<T> {
    /// Fails with `DimensionMismatch` if the noise model does not match the prior's tangent
    /// dimension.
    pub fn new(key: Key, prior: T, noise: Arc<dyn NoiseModel>) -> CoreResult<Self> {
        check_noise_dim(&prior, &noise)?;
        Ok(PriorFactor {
            keys: [key],
            prior,
            noise,
        })
    }

    pub fn key(&self) -> Key {
        self.keys[0]
    }

    pub fn prior(&self) -> &T {
        &self.prior
    }
}

impl<T: VariableValue> Factor for PriorFactor<T> {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.prior.tangent_dim()
    }

    fn noise_model(&self) -> &Arc<dyn NoiseModel> {
        &self.noise
    }

    fn evaluate(
        &self,
        values: &Values,
        compute_jacobians: bool,
    ) -> CoreResult<(DVector<f64>, Option<Vec<DMatrix<f64>>>)> {
        let dim = self.dim();
        let x = lookup::<T>(values, self.keys[0], dim)?;

        if !compute_jacobians {
            let residual = x.right_minus(&self.prior, None, None);
            return Ok((residual.to_dvector(), None));
        }

        let mut jacobian = x.identity_jacobian();
        let residual = x.right_minus(&self.prior, Some(&mut jacobian), None);
        Ok((
            residual.to_dvector(),
            Some(vec![jacobian_to_dmatrix::<T>(&jacobian, dim)]),
        ))
    }

    fn describe(&self) -> String {
        format!(
            "PriorFactor on [{}]: {}, {}",
            describe_keys(&self.keys),
            self.prior,
            self.noise.describe()
        )
    }
}
