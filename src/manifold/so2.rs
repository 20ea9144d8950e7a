//! SO(2) - planar rotations, the `Rot2` variable type.
//!
//! Stored as a unit complex number; the tangent is a single angle in radians.
//! SO(2) is abelian, so every Jacobian of `exp`/`log` is the 1×1 identity.

use crate::manifold::{LieGroup, ManifoldError, ManifoldResult, Tangent};
use nalgebra::{DVector, Matrix1, Matrix2, UnitComplex};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SO(2) group element.
#[derive(Debug, Clone, PartialEq)]
pub struct SO2 {
    complex: UnitComplex<f64>,
}

impl Display for SO2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Rot2(theta: {:.6})", self.angle())
    }
}

impl SO2 {
    pub const DOF: usize = 1;

    pub fn identity() -> Self {
        SO2 {
            complex: UnitComplex::identity(),
        }
    }

    pub fn new(complex: UnitComplex<f64>) -> Self {
        SO2 { complex }
    }

    pub fn from_angle(angle: f64) -> Self {
        SO2::new(UnitComplex::from_angle(angle))
    }

    pub fn complex(&self) -> UnitComplex<f64> {
        self.complex
    }

    /// Angle in `(-π, π]`.
    pub fn angle(&self) -> f64 {
        self.complex.angle()
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.complex.to_rotation_matrix().into_inner()
    }
}

impl LieGroup for SO2 {
    type TangentVector = SO2Tangent;
    type JacobianMatrix = Matrix1<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -Matrix1::identity();
        }
        SO2::new(self.complex.inverse())
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = Matrix1::identity();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix1::identity();
        }
        SO2::new(self.complex * other.complex)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        if let Some(jac) = jacobian {
            *jac = Matrix1::identity();
        }
        SO2Tangent::new(self.angle())
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        Matrix1::identity()
    }

    fn identity_jacobian(&self) -> Self::JacobianMatrix {
        Matrix1::identity()
    }

    fn tangent_dim(&self) -> usize {
        Self::DOF
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        SO2::from_angle(rng.random_range(-std::f64::consts::PI..std::f64::consts::PI))
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.complex.norm() - 1.0).abs() < tolerance
    }
}

/// Element of so(2): an angle in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct SO2Tangent {
    angle: f64,
}

impl Display for SO2Tangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "so2(theta: {:.6})", self.angle)
    }
}

impl SO2Tangent {
    pub fn new(angle: f64) -> Self {
        SO2Tangent { angle }
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }
}

impl Tangent<SO2> for SO2Tangent {
    const DIM: usize = 1;

    fn exp(&self, jacobian: Option<&mut <SO2 as LieGroup>::JacobianMatrix>) -> SO2 {
        if let Some(jac) = jacobian {
            *jac = Matrix1::identity();
        }
        SO2::from_angle(self.angle)
    }

    fn right_jacobian(&self) -> <SO2 as LieGroup>::JacobianMatrix {
        Matrix1::identity()
    }

    fn left_jacobian(&self) -> <SO2 as LieGroup>::JacobianMatrix {
        Matrix1::identity()
    }

    fn right_jacobian_inv(&self) -> <SO2 as LieGroup>::JacobianMatrix {
        Matrix1::identity()
    }

    fn left_jacobian_inv(&self) -> <SO2 as LieGroup>::JacobianMatrix {
        Matrix1::identity()
    }

    fn dim(&self) -> usize {
        Self::DIM
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_element(1, self.angle)
    }

    fn from_slice_like(_reference: &SO2, data: &[f64]) -> ManifoldResult<Self> {
        match data {
            [angle] if angle.is_finite() => Ok(SO2Tangent::new(*angle)),
            [_] => Err(ManifoldError::InvalidNumber),
            _ => Err(ManifoldError::InvalidTangentDimension {
                expected: Self::DIM,
                actual: data.len(),
            }),
        }
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        SO2Tangent::new(rng.random_range(-1.0..1.0))
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.angle.abs() < tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_so2_compose_wraps_angle() {
        let a = SO2::from_angle(3.0);
        let b = SO2::from_angle(1.0);
        let c = a.compose(&b, None, None);
        assert!((c.angle() - (4.0 - 2.0 * PI)).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_inverse() {
        let r = SO2::from_angle(0.7);
        let mut jac = Matrix1::zeros();
        let inv = r.inverse(Some(&mut jac));
        assert!((inv.angle() + 0.7).abs() < TOLERANCE);
        assert_eq!(jac[(0, 0)], -1.0);
    }

    #[test]
    fn test_so2_minus_takes_shortest_path() {
        let a = SO2::from_angle(PI - 0.1);
        let b = SO2::from_angle(-PI + 0.1);
        let d = b.minus(&a, None, None);
        assert!((d.angle() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_so2_from_slice_like() {
        let reference = SO2::identity();
        assert_eq!(
            SO2Tangent::from_slice_like(&reference, &[0.5]),
            Ok(SO2Tangent::new(0.5))
        );
        assert_eq!(
            SO2Tangent::from_slice_like(&reference, &[0.5, 1.0]),
            Err(ManifoldError::InvalidTangentDimension {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(
            SO2Tangent::from_slice_like(&reference, &[f64::INFINITY]),
            Err(ManifoldError::InvalidNumber)
        );
    }

    #[test]
    fn test_so2_rotation_matrix() {
        let m = SO2::from_angle(PI / 2.0).rotation_matrix();
        assert!((m[(0, 0)]).abs() < TOLERANCE);
        assert!((m[(1, 0)] - 1.0).abs() < TOLERANCE);
        assert!(SO2::from_angle(0.3).is_valid(1e-9));
    }
}
