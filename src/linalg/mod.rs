//! Sparse linear solvers for the damped normal equations.
//!
//! Given the stacked whitened Jacobian `A` and residual `r`, the solvers compute
//!
//! ```text
//! (AᵀA + λ·D)·δ = −Aᵀr
//! ```
//!
//! where `D` is selected by [`DampingMatrix`]. The symbolic analysis of `AᵀA` (including its
//! fill-reducing permutation) is cached on first use, since the sparsity pattern of a factor
//! graph does not change between iterations.

pub mod cholesky;
pub mod qr;

use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::Mul,
};

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

/// Damping term `D` of the augmented system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DampingMatrix {
    /// `D = I`.
    Identity,
    /// `D = diag(AᵀA)`, each entry clamped to `[min_diagonal, max_diagonal]`.
    Diagonal { min_diagonal: f64, max_diagonal: f64 },
}

impl Display for DampingMatrix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DampingMatrix::Identity => write!(f, "identity"),
            DampingMatrix::Diagonal {
                min_diagonal,
                max_diagonal,
            } => write!(f, "diag(AᵀA) in [{min_diagonal:e}, {max_diagonal:e}]"),
        }
    }
}

/// Linear algebra specific error types for sextant
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying faer error.
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Trait for sparse linear solvers that can solve both normal and augmented equations
pub trait SparseLinearSolver: Send {
    /// Solve the normal equation: `(AᵀA)·δ = −Aᵀr`
    ///
    /// # Errors
    /// `SingularMatrix` if `AᵀA` is not positive definite.
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve the augmented equation: `(AᵀA + λ·D)·δ = −Aᵀr`
    ///
    /// # Errors
    /// `SingularMatrix` if the damped system is not positive definite.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
        damping: DampingMatrix,
    ) -> LinAlgResult<Mat<f64>>;

    /// Undamped `AᵀA` from the last solve
    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>>;

    /// `Aᵀr` from the last solve
    fn get_gradient(&self) -> Option<&Mat<f64>>;

    /// `(AᵀA)⁻¹` from the last factorization, computed once and cached.
    ///
    /// Only meaningful after `solve_normal_equation`; after an augmented solve it is the
    /// inverse of the damped matrix.
    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>>;

    fn get_covariance_matrix(&self) -> Option<&Mat<f64>>;
}

/// Creates the solver for `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
    }
}

/// `H = AᵀA` and `g = Aᵀr`.
pub(crate) fn normal_equations(
    residuals: &Mat<f64>,
    jacobians: &SparseColMat<usize, f64>,
) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
    let jt = jacobians.as_ref().transpose();
    let hessian = jt
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobians.as_ref());

    let gradient = jacobians.as_ref().transpose().mul(residuals);
    Ok((hessian, gradient))
}

/// `H + λ·D`, always with an explicit diagonal so that the damped and undamped systems
/// share one sparsity pattern.
pub(crate) fn damped_hessian(
    hessian: &SparseColMat<usize, f64>,
    lambda: f64,
    damping: DampingMatrix,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let n = hessian.ncols();
    let diagonal = match damping {
        DampingMatrix::Identity => vec![1.0; n],
        DampingMatrix::Diagonal {
            min_diagonal,
            max_diagonal,
        } => {
            let mut diagonal = vec![0.0; n];
            for entry in hessian.triplet_iter() {
                if entry.row == entry.col {
                    diagonal[entry.row] += entry.val;
                }
            }
            diagonal
                .into_iter()
                .map(|d| d.clamp(min_diagonal, max_diagonal))
                .collect()
        }
    };

    let triplets: Vec<Triplet<usize, usize, f64>> = diagonal
        .iter()
        .enumerate()
        .map(|(i, &d)| Triplet::new(i, i, lambda * d))
        .collect();
    let damping_matrix = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create damping matrix".to_string())
            .log_with_source(e)
    })?;

    Ok(hessian.as_ref() + damping_matrix)
}

/// Fails with `SingularMatrix` when a solve produced non-finite entries.
pub(crate) fn check_finite(solution: Mat<f64>) -> LinAlgResult<Mat<f64>> {
    let finite = (0..solution.ncols())
        .all(|c| (0..solution.nrows()).all(|r| solution[(r, c)].is_finite()));
    if finite {
        Ok(solution)
    } else {
        Err(LinAlgError::SingularMatrix.log())
    }
}

/// Copies the `dim × dim` diagonal block starting at `offset` out of a full covariance.
pub fn extract_covariance_block(full_covariance: &Mat<f64>, offset: usize, dim: usize) -> Mat<f64> {
    Mat::from_fn(dim, dim, |i, j| full_covariance[(offset + i, offset + j)])
}

/// Copies the block `rows × cols` of a full covariance into a new matrix.
pub(crate) fn extract_covariance_cross_block(
    full_covariance: &Mat<f64>,
    row_offset: usize,
    col_offset: usize,
    rows: usize,
    cols: usize,
) -> Mat<f64> {
    Mat::from_fn(rows, cols, |i, j| {
        full_covariance[(row_offset + i, col_offset + j)]
    })
}
