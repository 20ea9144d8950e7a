use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::{Factor, check_noise_dim, describe_keys, lookup};
use crate::core::{
    CoreError, CoreResult,
    key::{Key, format_key},
    noise_model::NoiseModel,
    values::{Values, VariableValue},
};
use crate::manifold::{Tangent, jacobian_to_dmatrix};

/// Generic between factor for relative constraints on a Lie group.
///
/// Represents a relative measurement between two variables of the same group, such as an
/// odometry step or a loop closure. Works for every variable kind (`SE2`, `SO2`, `Rn`)
/// through static dispatch.
///
/// # Mathematical Formulation
///
/// Given variables `X₁`, `X₂` and a measurement `Z` of `X₁⁻¹ ∘ X₂`:
///
/// ```text
/// h = X₁⁻¹ ∘ X₂
/// r = Log(Z⁻¹ ∘ h)
/// ```
///
/// # Jacobian Computation
///
/// By the chain rule through `between` and `right_minus`:
///
/// ```text
/// ∂r/∂X₁ = -Jr⁻¹(r) · Ad(h⁻¹)
/// ∂r/∂X₂ =  Jr⁻¹(r)
/// ```
///
/// Each block is `DOF × DOF`; an SE(2) factor contributes two 3×3 blocks.
///
/// # Example
///
/// ```
/// use sextant::core::{noise_model::{DiagonalNoiseModel, NoiseModel}, values::Values};
/// use sextant::factors::{BetweenFactor, Factor};
/// use sextant::manifold::se2::SE2;
///
/// # fn example() -> sextant::error::SextantResult<()> {
/// let noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
/// let odometry = BetweenFactor::new(1, 2, SE2::from_xy_angle(2.0, 0.0, 0.0), noise)?;
///
/// let mut values = Values::new();
/// values.insert(1, SE2::from_xy_angle(1.0, 1.0, 0.0))?;
/// values.insert(2, SE2::from_xy_angle(3.0, 1.0, 0.0))?;
/// assert!(odometry.error(&values)? < 1e-12);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct BetweenFactor<T: VariableValue> {
    keys: [Key; 2],
    measured: T,
    noise: Arc<dyn NoiseModel>,
}

impl<T: VariableValue> BetweenFactor<T> {
    pub fn new(key1: Key, key2: Key, measured: T, noise: Arc<dyn NoiseModel>) -> CoreResult<Self> {
        if key1 == key2 {
            return Err(CoreError::InvalidFactor(format!(
                "between factor connects {} to itself",
                format_key(key1)
            )));
        }
        check_noise_dim(&measured, &noise)?;
        Ok(BetweenFactor {
            keys: [key1, key2],
            measured,
            noise,
        })
    }

    pub fn measured(&self) -> &T {
        &self.measured
    }
}

impl<T: VariableValue> Factor for BetweenFactor<T> {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.measured.tangent_dim()
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
        let x1 = lookup::<T>(values, self.keys[0], dim)?;
        let x2 = lookup::<T>(values, self.keys[1], dim)?;

        if !compute_jacobians {
            let relative = x1.between(x2, None, None);
            let residual = relative.right_minus(&self.measured, None, None);
            return Ok((residual.to_dvector(), None));
        }

        let mut j_relative_x1 = x1.identity_jacobian();
        let mut j_relative_x2 = x1.identity_jacobian();
        let relative = x1.between(x2, Some(&mut j_relative_x1), Some(&mut j_relative_x2));

        let mut j_residual_relative = x1.identity_jacobian();
        let residual = relative.right_minus(&self.measured, Some(&mut j_residual_relative), None);

        let jacobian1 = j_residual_relative.clone() * j_relative_x1;
        let jacobian2 = j_residual_relative * j_relative_x2;

        Ok((
            residual.to_dvector(),
            Some(vec![
                jacobian_to_dmatrix::<T>(&jacobian1, dim),
                jacobian_to_dmatrix::<T>(&jacobian2, dim),
            ]),
        ))
    }

    fn describe(&self) -> String {
        format!(
            "BetweenFactor on [{}]: {}, {}",
            describe_keys(&self.keys),
            self.measured,
            self.noise.describe()
        )
    }
}
