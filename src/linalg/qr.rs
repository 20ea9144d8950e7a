use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};

use crate::linalg::{
    DampingMatrix, LinAlgError, LinAlgResult, SparseLinearSolver, check_finite, damped_hessian,
    normal_equations,
};

/// Sparse QR solver for the (damped) normal equations.
///
/// Slower than [`SparseCholeskySolver`](super::SparseCholeskySolver) but does not require a
/// positive definite system to factorize. Rank deficiency shows up as non-finite entries in
/// the solution and is reported as [`LinAlgError::SingularMatrix`].
#[derive(Debug, Clone, Default)]
pub struct SparseQRSolver {
    factorizer: Option<Qr<usize, f64>>,

    /// Reused across solves; adding `λ·D` does not change the pattern.
    symbolic_factorization: Option<SymbolicQr<usize>>,

    hessian: Option<SparseColMat<usize, f64>>,
    gradient: Option<Mat<f64>>,
    covariance_matrix: Option<Mat<f64>>,
}

impl SparseQRSolver {
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
            cached_sym.clone()
        } else {
            let new_sym = SymbolicQr::try_new(system.symbolic()).map_err(|e| {
                LinAlgError::FactorizationFailed("Symbolic QR decomposition failed".to_string())
                    .log_with_source(e)
            })?;
            self.symbolic_factorization = Some(new_sym.clone());
            new_sym
        };

        let qr = Qr::try_new_with_symbolic(sym, system.as_ref())
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        let dx = check_finite(qr.solve(-&gradient))?;
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        self.factorizer = Some(qr);
        self.covariance_matrix = None;

        Ok(dx)
    }
}

impl SparseLinearSolver for SparseQRSolver {
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
            let identity = Mat::identity(n, n);
            self.covariance_matrix = Some(factorizer.solve(&identity));
        }
        self.covariance_matrix.as_ref()
    }

    fn get_covariance_matrix(&self) -> Option<&Mat<f64>> {
        self.covariance_matrix.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::SparseCholeskySolver;
    use faer::sparse::Triplet;

    const TOLERANCE: f64 = 1e-9;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_data()
    -> Result<(SparseColMat<usize, f64>, Mat<f64>), faer::sparse::CreationError> {
        let triplets = vec![
            Triplet::new(0, 0, 2.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(1, 2, 1.0),
            Triplet::new(2, 1, 1.0),
            Triplet::new(2, 2, 2.0),
            Triplet::new(3, 0, 1.5),
            Triplet::new(3, 2, 0.5),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(4, 3, &triplets)?;
        let residuals = Mat::from_fn(4, 1, |i, _| [1.0, -2.0, 0.5, 1.2][i]);
        Ok((jacobian, residuals))
    }

    #[test]
    fn test_qr_matches_cholesky() -> TestResult {
        let (jacobian, residuals) = create_test_data()?;
        let mut qr = SparseQRSolver::new();
        let mut cholesky = SparseCholeskySolver::new();

        let damping = DampingMatrix::Diagonal {
            min_diagonal: 1e-6,
            max_diagonal: 1e32,
        };
        for lambda in [0.0, 1e-3, 10.0] {
            let a = qr.solve_augmented_equation(&residuals, &jacobian, lambda, damping)?;
            let b = cholesky.solve_augmented_equation(&residuals, &jacobian, lambda, damping)?;
            for i in 0..3 {
                assert!((a[(i, 0)] - b[(i, 0)]).abs() < TOLERANCE, "lambda {lambda}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_qr_normal_equation_known_solution() -> TestResult {
        let mut solver = SparseQRSolver::new();
        let triplets = vec![Triplet::new(0, 0, 2.0), Triplet::new(1, 1, 4.0)];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| -((i + 1) as f64));

        // δ = -r ./ diag(J)
        let solution = solver.solve_normal_equation(&residuals, &jacobian)?;
        assert!((solution[(0, 0)] - 0.5).abs() < TOLERANCE);
        assert!((solution[(1, 0)] - 0.5).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_qr_covariance_matrix() -> TestResult {
        let mut solver = SparseQRSolver::new();
        let triplets = vec![
            Triplet::new(0, 0, 3.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 2.0),
        ];
        let jacobian = SparseColMat::try_new_from_triplets(2, 2, &triplets)?;
        let residuals = Mat::from_fn(2, 1, |i, _| (i + 1) as f64);
        solver.solve_normal_equation(&residuals, &jacobian)?;

        let cov = solver.compute_covariance_matrix().ok_or("missing covariance")?;
        assert!((cov[(0, 0)] - 0.2).abs() < TOLERANCE);
        assert!((cov[(1, 1)] - 0.4).abs() < TOLERANCE);
        assert!((cov[(0, 1)] + 0.2).abs() < TOLERANCE);
        Ok(())
    }
}
