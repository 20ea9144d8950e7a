//! Rⁿ - Euclidean vectors under addition, the `Vector` variable type.
//!
//! The dimension is decided at runtime, so Jacobians are `DMatrix` sized from the element.
//! Callers are expected to check that both operands share a dimension; factors do so
//! before evaluating.

use crate::manifold::{LieGroup, ManifoldError, ManifoldResult, Tangent};
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Rⁿ group element.
#[derive(Debug, Clone, PartialEq)]
pub struct Rn {
    data: DVector<f64>,
}

fn write_components(f: &mut Formatter<'_>, data: &DVector<f64>) -> fmt::Result {
    for (i, val) in data.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{val:.6}")?;
    }
    Ok(())
}

impl Display for Rn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Vector{}([", self.data.len())?;
        write_components(f, &self.data)?;
        write!(f, "])")
    }
}

impl From<DVector<f64>> for Rn {
    fn from(data: DVector<f64>) -> Self {
        Rn::new(data)
    }
}

impl From<Rn> for DVector<f64> {
    fn from(rn: Rn) -> Self {
        rn.data
    }
}

impl Rn {
    pub fn new(data: DVector<f64>) -> Self {
        Rn { data }
    }

    pub fn from_slice(slice: &[f64]) -> Self {
        Rn::new(DVector::from_row_slice(slice))
    }

    pub fn zeros(dim: usize) -> Self {
        Rn::new(DVector::zeros(dim))
    }

    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    pub fn dim(&self) -> usize {
        self.data.len()
    }

    pub fn component(&self, index: usize) -> f64 {
        self.data[index]
    }

    pub fn norm(&self) -> f64 {
        self.data.norm()
    }

    pub fn random_with_dim(dim: usize) -> Self {
        Rn::new(DVector::from_fn(dim, |_, _| rand::random::<f64>() * 10.0 - 5.0))
    }
}

impl LieGroup for Rn {
    type TangentVector = RnTangent;
    type JacobianMatrix = DMatrix<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.identity_jacobian();
        }
        Rn::new(-&self.data)
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        debug_assert_eq!(self.dim(), other.dim());
        if let Some(jac_self) = jacobian_self {
            *jac_self = self.identity_jacobian();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = self.identity_jacobian();
        }
        Rn::new(&self.data + &other.data)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        if let Some(jac) = jacobian {
            *jac = self.identity_jacobian();
        }
        RnTangent::new(self.data.clone())
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        self.identity_jacobian()
    }

    fn identity_jacobian(&self) -> Self::JacobianMatrix {
        DMatrix::identity(self.dim(), self.dim())
    }

    fn tangent_dim(&self) -> usize {
        self.data.len()
    }

    /// Random 3-vector in `[-5, 5)³`.
    fn random() -> Self {
        Rn::random_with_dim(3)
    }

    fn is_valid(&self, _tolerance: f64) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    fn right_plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        debug_assert_eq!(self.dim(), tangent.data.len());
        if let Some(jac_self) = jacobian_self {
            *jac_self = self.identity_jacobian();
        }
        if let Some(jac_tangent) = jacobian_tangent {
            *jac_tangent = self.identity_jacobian();
        }
        Rn::new(&self.data + &tangent.data)
    }

    fn right_minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        debug_assert_eq!(self.dim(), other.dim());
        if let Some(jac_self) = jacobian_self {
            *jac_self = self.identity_jacobian();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = -self.identity_jacobian();
        }
        RnTangent::new(&self.data - &other.data)
    }
}

/// Element of the tangent space of Rⁿ, which is Rⁿ itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RnTangent {
    data: DVector<f64>,
}

impl Display for RnTangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "rn([")?;
        write_components(f, &self.data)?;
        write!(f, "])")
    }
}

impl RnTangent {
    pub fn new(data: DVector<f64>) -> Self {
        RnTangent { data }
    }

    pub fn zeros(dim: usize) -> Self {
        RnTangent::new(DVector::zeros(dim))
    }

    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    fn identity(&self) -> DMatrix<f64> {
        DMatrix::identity(self.data.len(), self.data.len())
    }
}

impl Tangent<Rn> for RnTangent {
    const DIM: usize = 0;

    fn exp(&self, jacobian: Option<&mut <Rn as LieGroup>::JacobianMatrix>) -> Rn {
        if let Some(jac) = jacobian {
            *jac = self.identity();
        }
        Rn::new(self.data.clone())
    }

    fn right_jacobian(&self) -> <Rn as LieGroup>::JacobianMatrix {
        self.identity()
    }

    fn left_jacobian(&self) -> <Rn as LieGroup>::JacobianMatrix {
        self.identity()
    }

    fn right_jacobian_inv(&self) -> <Rn as LieGroup>::JacobianMatrix {
        self.identity()
    }

    fn left_jacobian_inv(&self) -> <Rn as LieGroup>::JacobianMatrix {
        self.identity()
    }

    fn dim(&self) -> usize {
        self.data.len()
    }

    fn to_dvector(&self) -> DVector<f64> {
        self.data.clone()
    }

    fn from_slice_like(reference: &Rn, data: &[f64]) -> ManifoldResult<Self> {
        if data.len() != reference.dim() {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: reference.dim(),
                actual: data.len(),
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }
        Ok(RnTangent::new(DVector::from_row_slice(data)))
    }

    /// Random 3-vector in `[-1, 1)³`.
    fn random() -> Self {
        RnTangent::new(DVector::from_fn(3, |_, _| rand::random::<f64>() * 2.0 - 1.0))
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rn_basic_operations() {
        let v1 = Rn::from_slice(&[1.0, 2.0, 3.0]);
        let v2 = Rn::from_slice(&[4.0, 5.0, 6.0]);

        let sum = v1.compose(&v2, None, None);
        assert_eq!(sum, Rn::from_slice(&[5.0, 7.0, 9.0]));

        let inv = v1.inverse(None);
        assert_eq!(inv, Rn::from_slice(&[-1.0, -2.0, -3.0]));
        assert!(v1.compose(&inv, None, None).is_approx(&Rn::zeros(3), 1e-12));
    }

    #[test]
    fn test_rn_plus_minus_jacobians() {
        let v = Rn::from_slice(&[1.0, -1.0]);
        let w = Rn::from_slice(&[3.0, 0.5]);
        let mut j_self = DMatrix::zeros(0, 0);
        let mut j_other = DMatrix::zeros(0, 0);
        let d = w.minus(&v, Some(&mut j_self), Some(&mut j_other));

        assert_eq!(d.data(), &DVector::from_row_slice(&[2.0, 1.5]));
        assert_eq!(j_self, DMatrix::identity(2, 2));
        assert_eq!(j_other, -DMatrix::identity(2, 2));

        let back = v.plus(&d, None, None);
        assert_eq!(back, w);
    }

    #[test]
    fn test_rn_between_uses_element_dimension() {
        let a = Rn::from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let b = Rn::from_slice(&[2.0, 2.0, 2.0, 2.0]);
        let mut j_a = DMatrix::zeros(0, 0);
        let mut j_b = DMatrix::zeros(0, 0);
        let rel = a.between(&b, Some(&mut j_a), Some(&mut j_b));

        assert_eq!(rel, Rn::from_slice(&[1.0, 0.0, -1.0, -2.0]));
        assert_eq!(j_a, -DMatrix::identity(4, 4));
        assert_eq!(j_b, DMatrix::identity(4, 4));
    }

    #[test]
    fn test_rn_from_slice_like_checks_dimension() {
        let reference = Rn::zeros(2);
        assert!(RnTangent::from_slice_like(&reference, &[1.0, 2.0]).is_ok());
        assert_eq!(
            RnTangent::from_slice_like(&reference, &[1.0]),
            Err(ManifoldError::InvalidTangentDimension {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_rn_display() {
        let v = Rn::from_slice(&[1.0, 2.5]);
        assert_eq!(v.to_string(), "Vector2([1.000000, 2.500000])");
    }
}
