use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};

use crate::linalg::{
    DampingMatrix, LinAlgError, LinAlgResult, SparseLinearSolver, check_finite, damped_hessian,
    normal_equations,
};

/// Sparse LLᵀ solver for the (damped) normal equations.
///
/// The default solver. Positive definiteness doubles as the singularity test: a failed
/// numeric factorization is reported as [`LinAlgError::SingularMatrix`].
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,

    /// Symbolic factorization of the first system seen. The pattern of `AᵀA + λ·D` is fixed
    /// for a given graph, so it is reused for every later solve.
    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// Undamped `AᵀA` of the last solve.
    hessian: Option<SparseColMat<usize, f64>>,

    /// `Aᵀr` of the last solve.
    gradient: Option<Mat<f64>>,

    covariance_matrix: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn solve_system(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
        damping: DampingMatrix,
    ) -> LinAlgResult<Mat<f64>> {
        let (hessian, gradient) = normal_equations(residuals, jacobians)?;
        let system = damped_hessian(&hessian, lambda, damping)?;

        let sym = if let Some(ref cached_sym) = self.symbolic_factorization {
            // SymbolicLlt is reference-counted; clone is O(1).
            cached_sym.clone()
        } else {
            let new_sym = SymbolicLlt::try_new(system.symbolic(), Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed(
                    "Symbolic Cholesky decomposition failed".to_string(),
                )
                .log_with_source(e)
            })?;
            self.symbolic_factorization = Some(new_sym.clone());
            new_sym
        };

        let cholesky = Llt::try_new_with_symbolic(sym, system.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        let dx = check_finite(cholesky.solve(-&gradient))?;
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        self.factorizer = Some(cholesky);
        self.covariance_matrix = None;

        Ok(dx)
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        self.solve_system(residuals, jacobians, 0.0, DampingMatrix::Identity)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
        damping: DampingMatrix,
    ) -> LinAlgResult<Mat<f64>> {
        self.solve_system(residuals, jacobians, lambda, damping)
    }

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }

    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>> {
        if self.covariance_matrix.is_none()
            && let (Some(factorizer), Some(hessian)) = (&self.factorizer, &self.hessian)
        {
            let n = hessian.ncols();
            // H·X = I
            let identity = Mat::identity(n, n);
            self.covariance_matrix = Some(factorizer.solve(&identity));
        }
        self.covariance_matrix.as_ref()
    }

    fn get_covariance_matrix(&self) -> Option<&Mat<f64>> {
        self.covariance_matrix.as_ref()
    }
}
