//! SE(2) - planar rigid motions, the `Pose2` variable type.
//!
//! Elements are stored as a translation plus a unit complex rotation. Tangent vectors are
//! ordered `[x, y, θ]`: translational part first, rotational part last.
//!
//! All closed-form maps share the coefficients
//!
//! ```text
//! a  = sin θ / θ              b  = (1 - cos θ) / θ
//! c₁ = (1 - cos θ) / θ²       s₁ = (θ - sin θ) / θ²
//! ```
//!
//! which are evaluated through `1 - cos θ = 2 sin²(θ/2)` to avoid cancellation and through
//! their Taylor series below `θ² < 1e-10`.

use crate::manifold::{LieGroup, ManifoldError, ManifoldResult, Tangent, so2::SO2};
use nalgebra::{DVector, Matrix2, Matrix3, Point2, UnitComplex, Vector2, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

const SMALL_ANGLE_SQ: f64 = 1e-10;

/// Shared trigonometric coefficients of the SE(2) exponential and its Jacobians.
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    a: f64,
    b: f64,
    c1: f64,
    s1: f64,
}

impl Coefficients {
    fn new(theta: f64) -> Self {
        let theta_sq = theta * theta;
        if theta_sq < SMALL_ANGLE_SQ {
            Self {
                a: 1.0 - theta_sq / 6.0,
                b: 0.5 * theta - theta * theta_sq / 24.0,
                c1: 0.5 - theta_sq / 24.0,
                s1: theta / 6.0 - theta * theta_sq / 120.0,
            }
        } else {
            let half_sin = (0.5 * theta).sin();
            let one_minus_cos = 2.0 * half_sin * half_sin;
            Self {
                a: theta.sin() / theta,
                b: one_minus_cos / theta,
                c1: one_minus_cos / theta_sq,
                s1: (theta - theta.sin()) / theta_sq,
            }
        }
    }

    /// `V(θ)`, the matrix mapping the tangent translation to the group translation.
    fn v_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.a, -self.b, self.b, self.a)
    }

    fn v_inverse(&self) -> Matrix2<f64> {
        let den = 1.0 / (self.a * self.a + self.b * self.b);
        Matrix2::new(self.a, self.b, -self.b, self.a) * den
    }
}

/// SE(2) group element.
#[derive(Debug, Clone, PartialEq)]
pub struct SE2 {
    translation: Vector2<f64>,
    rotation: UnitComplex<f64>,
}

impl Display for SE2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose2(x: {:.6}, y: {:.6}, theta: {:.6})",
            self.x(),
            self.y(),
            self.angle()
        )
    }
}

impl From<SE2> for DVector<f64> {
    fn from(pose: SE2) -> Self {
        DVector::from_vec(vec![pose.x(), pose.y(), pose.angle()])
    }
}

impl SE2 {
    /// Degrees of freedom.
    pub const DOF: usize = 3;

    pub fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            translation,
            rotation,
        }
    }

    /// Creates a pose from `x`, `y` and heading `theta` in radians.
    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        Self::new(Vector2::new(x, y), UnitComplex::from_angle(theta))
    }

    pub fn from_translation_so2(translation: Vector2<f64>, rotation: &SO2) -> Self {
        Self::new(translation, rotation.complex())
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn rotation_so2(&self) -> SO2 {
        SO2::new(self.rotation)
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 3×3 matrix `[R t; 0 1]`.
    pub fn matrix(&self) -> Matrix3<f64> {
        let mut m = Matrix3::identity();
        m.fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&self.rotation_matrix());
        m[(0, 2)] = self.translation.x;
        m[(1, 2)] = self.translation.y;
        m
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Heading in `(-π, π]`.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Transforms a point from the local frame into the world frame.
    pub fn transform_from(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation.transform_point(&Point2::from(*point)).coords + self.translation
    }
}

impl LieGroup for SE2 {
    type TangentVector = SE2Tangent;
    type JacobianMatrix = Matrix3<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        let rot_inv = self.rotation.inverse();
        let trans_inv = -(rot_inv * self.translation);

        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }

        SE2::new(trans_inv, rot_inv)
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let result = SE2::new(
            self.transform_from(&other.translation),
            self.rotation * other.rotation,
        );

        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }

        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }

        result
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        let theta = self.angle();
        let rho = Coefficients::new(theta).v_inverse() * self.translation;
        let result = SE2Tangent::new(rho.x, rho.y, theta);

        if let Some(jac) = jacobian {
            *jac = result.right_jacobian_inv();
        }

        result
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        let mut adjoint_matrix = Matrix3::identity();
        adjoint_matrix
            .fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&self.rotation_matrix());
        adjoint_matrix[(0, 2)] = self.y();
        adjoint_matrix[(1, 2)] = -self.x();
        adjoint_matrix
    }

    fn identity_jacobian(&self) -> Self::JacobianMatrix {
        Matrix3::identity()
    }

    fn tangent_dim(&self) -> usize {
        Self::DOF
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        SE2::from_xy_angle(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
        )
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.rotation.norm() - 1.0).abs() < tolerance
            && self.translation.iter().all(|v| v.is_finite())
    }
}

/// Element of se(2) as `[x, y, θ]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE2Tangent {
    data: Vector3<f64>,
}

impl Display for SE2Tangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "se2(x: {:.6}, y: {:.6}, theta: {:.6})",
            self.x(),
            self.y(),
            self.angle()
        )
    }
}

impl SE2Tangent {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        SE2Tangent {
            data: Vector3::new(x, y, theta),
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn x(&self) -> f64 {
        self.data[0]
    }

    pub fn y(&self) -> f64 {
        self.data[1]
    }

    pub fn angle(&self) -> f64 {
        self.data[2]
    }

    pub fn as_vector(&self) -> &Vector3<f64> {
        &self.data
    }

    /// `Jr` with the translational coupling column built from `c₁` and `s₁`.
    fn right_jacobian_at(x: f64, y: f64, theta: f64) -> Matrix3<f64> {
        let k = Coefficients::new(theta);
        Matrix3::new(
            k.a,
            k.b,
            x * k.s1 - y * k.c1,
            -k.b,
            k.a,
            x * k.c1 + y * k.s1,
            0.0,
            0.0,
            1.0,
        )
    }

    /// `Jr⁻¹ = [A⁻¹, -A⁻¹c; 0, 1]` where `Jr = [A, c; 0, 1]`.
    fn right_jacobian_inv_at(x: f64, y: f64, theta: f64) -> Matrix3<f64> {
        let k = Coefficients::new(theta);
        let a_inv = Matrix2::new(k.a, -k.b, k.b, k.a) / (k.a * k.a + k.b * k.b);
        let c = Vector2::new(x * k.s1 - y * k.c1, x * k.c1 + y * k.s1);
        let top_right = -(a_inv * c);

        let mut jac = Matrix3::identity();
        jac.fixed_view_mut::<2, 2>(0, 0).copy_from(&a_inv);
        jac[(0, 2)] = top_right.x;
        jac[(1, 2)] = top_right.y;
        jac
    }
}

impl Tangent<SE2> for SE2Tangent {
    const DIM: usize = 3;

    fn exp(&self, jacobian: Option<&mut <SE2 as LieGroup>::JacobianMatrix>) -> SE2 {
        let theta = self.angle();
        let translation = Coefficients::new(theta).v_matrix() * Vector2::new(self.x(), self.y());

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SE2::new(translation, UnitComplex::from_angle(theta))
    }

    fn right_jacobian(&self) -> <SE2 as LieGroup>::JacobianMatrix {
        Self::right_jacobian_at(self.x(), self.y(), self.angle())
    }

    /// `Jl(τ) = Jr(-τ)`.
    fn left_jacobian(&self) -> <SE2 as LieGroup>::JacobianMatrix {
        Self::right_jacobian_at(-self.x(), -self.y(), -self.angle())
    }

    fn right_jacobian_inv(&self) -> <SE2 as LieGroup>::JacobianMatrix {
        Self::right_jacobian_inv_at(self.x(), self.y(), self.angle())
    }

    fn left_jacobian_inv(&self) -> <SE2 as LieGroup>::JacobianMatrix {
        Self::right_jacobian_inv_at(-self.x(), -self.y(), -self.angle())
    }

    fn dim(&self) -> usize {
        Self::DIM
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_slice_like(_reference: &SE2, data: &[f64]) -> ManifoldResult<Self> {
        match data {
            [x, y, theta] => {
                if data.iter().any(|v| !v.is_finite()) {
                    return Err(ManifoldError::InvalidNumber);
                }
                Ok(SE2Tangent::new(*x, *y, *theta))
            }
            _ => Err(ManifoldError::InvalidTangentDimension {
                expected: Self::DIM,
                actual: data.len(),
            }),
        }
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        SE2Tangent::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        )
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }
}
