//! Lie group representations for optimization on non-Euclidean variables.
//!
//! Variables in a factor graph live on manifolds:
//! - **SE(2)**: planar rigid transformations (robot poses)
//! - **SO(2)**: planar rotations (headings)
//! - **Rⁿ**: plain vectors (landmarks, biases, calibration)
//!
//! Lie group M,° | dim | X ∈ M             | T_X M       | Exp(τ)          | Comp. | Action
//! ------------- | --- | ----------------- | ----------- | --------------- | ----- | ------
//! n-D vector    | n   | v ∈ Rⁿ            | v ∈ Rⁿ      | v = exp(v)      | v₁+v₂ | v + x
//! Rotation      | 1   | R                 | θ ∈ R       | R = exp([θ]x)   | R₁R₂  | Rx
//! Rigid motion  | 3   | M = [R t; 0 1]    | [ρ θ] ∈ R³  | Exp([ρ θ])      | M₁M₂  | Rx+t
//!
//! Conventions follow [manif](https://github.com/artivis/manif): every operation can
//! return its Jacobian w.r.t. a perturbation on the local (right) tangent space, so
//!
//! ```text
//! X ⊞ τ = X ∘ Exp(τ)        Y ⊟ X = Log(X⁻¹ ∘ Y)
//! ```
//!
//! Factors chain these Jacobians to obtain analytic derivatives of their residuals.

use nalgebra::{DMatrix, DVector};
use std::ops::{Index, Mul, Neg};
use std::{
    error, fmt,
    fmt::{Display, Formatter},
};

pub mod rn;
pub mod se2;
pub mod so2;

/// Errors raised by manifold element construction and conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// A tangent vector had the wrong number of components.
    InvalidTangentDimension { expected: usize, actual: usize },
    /// A coordinate was NaN or infinite.
    InvalidNumber,
    /// The element violates its group constraint.
    InvalidElement(String),
}

/// Tag identifying the manifold a variable lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifoldType {
    RN,
    SE2,
    SO2,
}

impl Display for ManifoldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldType::RN => write!(f, "Vector"),
            ManifoldType::SE2 => write!(f, "Pose2"),
            ManifoldType::SO2 => write!(f, "Rot2"),
        }
    }
}

impl Display for ManifoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::InvalidTangentDimension { expected, actual } => {
                write!(
                    f,
                    "Invalid tangent dimension: expected {expected}, got {actual}"
                )
            }
            ManifoldError::InvalidNumber => {
                write!(f, "Invalid number: NaN or Inf detected")
            }
            ManifoldError::InvalidElement(msg) => {
                write!(f, "Invalid manifold element: {msg}")
            }
        }
    }
}

impl error::Error for ManifoldError {}

pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Core trait for Lie group elements.
///
/// All Jacobians are expressed w.r.t. right (local) perturbations. Elements with a
/// runtime dimension (Rⁿ) size their Jacobians from `self`.
pub trait LieGroup: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Tangent space (Lie algebra in vector form).
    type TangentVector: Tangent<Self>;

    /// Square Jacobian of size `tangent_dim × tangent_dim`.
    type JacobianMatrix: Clone
        + PartialEq
        + fmt::Debug
        + Neg<Output = Self::JacobianMatrix>
        + Mul<Output = Self::JacobianMatrix>
        + Index<(usize, usize), Output = f64>;

    /// `X⁻¹`, with `J = -Ad(X)`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self;

    /// `X ∘ Y`, with `J_X = Ad(Y⁻¹)` and `J_Y = I`.
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self;

    /// Logarithmic map to the tangent space, with `J = Jr⁻¹(τ)`.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector;

    /// Adjoint matrix, mapping right-tangent vectors to left-tangent vectors.
    fn adjoint(&self) -> Self::JacobianMatrix;

    /// Identity Jacobian sized for this element.
    fn identity_jacobian(&self) -> Self::JacobianMatrix;

    /// Number of degrees of freedom of this element.
    fn tangent_dim(&self) -> usize;

    /// Random element, used by property tests.
    fn random() -> Self;

    fn is_valid(&self, tolerance: f64) -> bool;

    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.tangent_dim() == other.tangent_dim()
            && self.right_minus(other, None, None).is_zero(tolerance)
    }

    /// Right plus: `X ⊞ τ = X ∘ Exp(τ)`.
    fn right_plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let exp_tangent = tangent.exp(None);

        if let Some(jac_tangent) = jacobian_tangent {
            *jac_tangent = tangent.right_jacobian();
        }

        self.compose(&exp_tangent, jacobian_self, None)
    }

    /// Right minus: `Y ⊟ X = Log(X⁻¹ ∘ Y)` with `self = Y`, `other = X`.
    ///
    /// `J_Y = Jr⁻¹(τ)` and `J_X = -Jl⁻¹(τ)`.
    fn right_minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        let other_inverse = other.inverse(None);
        let result_group = other_inverse.compose(self, None, None);
        let result = result_group.log(None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = result.right_jacobian_inv();
        }

        if let Some(jac_other) = jacobian_other {
            *jac_other = -result.left_jacobian_inv();
        }

        result
    }

    fn plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        self.right_plus(tangent, jacobian_self, jacobian_tangent)
    }

    fn minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        self.right_minus(other, jacobian_self, jacobian_other)
    }

    /// Relative element `X⁻¹ ∘ Y`, with `J_X = -Ad((X⁻¹Y)⁻¹)` and `J_Y = I`.
    fn between(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let self_inverse = self.inverse(None);
        let result = self_inverse.compose(other, None, None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = -result.inverse(None).adjoint();
        }

        if let Some(jac_other) = jacobian_other {
            *jac_other = other.identity_jacobian();
        }

        result
    }

    /// Tangent-space difference `Log(self⁻¹ ∘ other)` as a flat vector.
    fn local_coordinates(&self, other: &Self) -> DVector<f64> {
        other.right_minus(self, None, None).to_dvector()
    }
}

/// Tangent space of a Lie group.
pub trait Tangent<Group: LieGroup>: Clone + PartialEq + fmt::Debug {
    /// Compile-time dimension; zero for runtime-sized tangents.
    const DIM: usize;

    /// Exponential map, with `J = Jr(τ)`.
    fn exp(&self, jacobian: Option<&mut Group::JacobianMatrix>) -> Group;

    fn right_jacobian(&self) -> Group::JacobianMatrix;

    fn left_jacobian(&self) -> Group::JacobianMatrix;

    fn right_jacobian_inv(&self) -> Group::JacobianMatrix;

    fn left_jacobian_inv(&self) -> Group::JacobianMatrix;

    fn dim(&self) -> usize;

    fn to_dvector(&self) -> DVector<f64>;

    /// Builds a tangent from a flat slice, checking its length against `reference`.
    fn from_slice_like(reference: &Group, data: &[f64]) -> ManifoldResult<Self>;

    fn random() -> Self;

    fn is_zero(&self, tolerance: f64) -> bool;
}

/// Copies a fixed or dynamic Jacobian into a dense `DMatrix` block.
pub fn jacobian_to_dmatrix<G: LieGroup>(jacobian: &G::JacobianMatrix, dim: usize) -> DMatrix<f64> {
    DMatrix::from_fn(dim, dim, |r, c| jacobian[(r, c)])
}
