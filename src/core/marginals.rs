//! Marginal covariances of variables at a solution.
//!
//! Linearizes the graph once, factors the information matrix `AᵀA` and keeps its dense
//! inverse. Each marginal is then a block of that inverse, expressed in the tangent space of
//! the variable at the linearization point.
//!
//! ```
//! use sextant::core::marginals::Marginals;
//! use sextant::core::{factor_graph::FactorGraph, key::symbol, values::Values};
//! use sextant::core::noise_model::{DiagonalNoiseModel, NoiseModel};
//! use sextant::factors::PriorFactor;
//! use sextant::manifold::se2::SE2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
//! let mut graph = FactorGraph::new();
//! graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), noise)?);
//!
//! let mut values = Values::new();
//! values.insert(symbol('x', 1), SE2::identity())?;
//!
//! let marginals = Marginals::new(&graph, &values)?;
//! let cov = marginals.marginal_covariance(symbol('x', 1))?;
//! assert!((cov[(0, 0)] - 0.09).abs() < 1e-12);
//! # Ok(())
//! # }
//! ```

use faer::Mat;
use tracing::debug;

use crate::core::{
    CoreError, factor_graph::FactorGraph, key::Key, ordering::Ordering, values::Values,
};
use crate::error::SextantResult;
use crate::linalg::{
    LinAlgError, LinearSolverType, check_finite, create_linear_solver, extract_covariance_block,
    extract_covariance_cross_block,
};

/// Marginal covariances of every variable in a graph at fixed values.
#[derive(Debug, Clone)]
pub struct Marginals {
    ordering: Ordering,
    covariance: Mat<f64>,
}

impl Marginals {
    /// Computes marginals with the sparse Cholesky solver.
    pub fn new(graph: &FactorGraph, values: &Values) -> SextantResult<Self> {
        Self::with_solver_type(graph, values, LinearSolverType::SparseCholesky)
    }

    /// Computes marginals with the given factorization.
    ///
    /// Fails with [`LinAlgError::SingularMatrix`] when the information matrix is not
    /// positive definite, e.g. a pose graph without any prior.
    pub fn with_solver_type(
        graph: &FactorGraph,
        values: &Values,
        solver_type: LinearSolverType,
    ) -> SextantResult<Self> {
        graph.validate(values)?;
        let ordering = Ordering::natural(graph, values)?;
        let structure = graph.build_symbolic_structure(&ordering)?;
        let system = graph.linearize_with(values, &ordering, &structure)?;

        let mut solver = create_linear_solver(solver_type);
        solver.solve_normal_equation(&system.residual, &system.jacobian)?;
        let covariance = solver
            .compute_covariance_matrix()
            .cloned()
            .ok_or_else(|| {
                LinAlgError::FactorizationFailed("covariance not available".to_string()).log()
            })?;
        let covariance = check_finite(covariance)?;

        debug!(
            "Marginals computed for {} variables ({} solver)",
            ordering.len(),
            solver_type
        );

        Ok(Self {
            ordering,
            covariance,
        })
    }

    /// Tangent-space covariance of one variable.
    pub fn marginal_covariance(&self, key: Key) -> SextantResult<Mat<f64>> {
        let (offset, dim) = self.block(key)?;
        Ok(extract_covariance_block(&self.covariance, offset, dim))
    }

    /// Joint covariance of several variables, blocks stacked in the order of `keys`.
    pub fn joint_marginal_covariance(&self, keys: &[Key]) -> SextantResult<Mat<f64>> {
        let blocks = keys
            .iter()
            .map(|&key| self.block(key))
            .collect::<SextantResult<Vec<_>>>()?;
        let total: usize = blocks.iter().map(|&(_, dim)| dim).sum();

        let mut joint = Mat::<f64>::zeros(total, total);
        let mut row = 0;
        for &(row_offset, rows) in &blocks {
            let mut col = 0;
            for &(col_offset, cols) in &blocks {
                let block = extract_covariance_cross_block(
                    &self.covariance,
                    row_offset,
                    col_offset,
                    rows,
                    cols,
                );
                for i in 0..rows {
                    for j in 0..cols {
                        joint[(row + i, col + j)] = block[(i, j)];
                    }
                }
                col += cols;
            }
            row += rows;
        }
        Ok(joint)
    }

    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    fn block(&self, key: Key) -> SextantResult<(usize, usize)> {
        self.ordering
            .offset(key)
            .zip(self.ordering.dim(key))
            .ok_or_else(|| CoreError::KeyNotFound { key }.log().into())
    }
}
