//! Factor graph container and sparse linearization.
//!
//! The graph owns its factors as trait objects and knows nothing about variable values; every
//! evaluation takes a [`Values`] snapshot. Linearization stacks the whitened Jacobian blocks of
//! all factors into one sparse matrix `A` (rows in factor order, columns per [`Ordering`]) and
//! the whitened residuals into `r`, so that the Gauss-Newton system is `AᵀA·δ = −Aᵀr`.
//!
//! The sparsity pattern only depends on the graph and the ordering, so it is computed once by
//! [`FactorGraph::build_symbolic_structure`] and reused by [`FactorGraph::linearize_with`].

use std::fmt::{self, Display, Formatter};

use faer::{
    Mat,
    sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat},
};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{
    CoreError, CoreResult,
    key::{Key, format_key},
    ordering::Ordering,
    values::Values,
};
use crate::factors::{Factor, JacobianFactor};

/// Sparsity pattern of the stacked Jacobian for a fixed graph and ordering.
///
/// # Fields
///
/// - `pattern`: row/column indices of every structural non-zero
/// - `order`: permutation from push order to column-major storage order
/// - `row_offsets`: first residual row of each factor
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
    pub row_offsets: Vec<usize>,
}

impl SymbolicStructure {
    pub fn nrows(&self) -> usize {
        self.pattern.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.pattern.ncols()
    }

    pub fn nnz(&self) -> usize {
        self.pattern.compute_nnz()
    }
}

/// Whitened linear system `A·δ ≈ −r` at one linearization point.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub jacobian: SparseColMat<usize, f64>,
    /// `nrows × 1` whitened residual.
    pub residual: Mat<f64>,
}

impl LinearSystem {
    /// `0.5·‖r‖²`, the Gauss-Newton model error at `δ = 0`.
    pub fn error(&self) -> f64 {
        let norm = self.residual.norm_l2();
        0.5 * norm * norm
    }
}

/// An ordered collection of factors.
///
/// # Example
///
/// ```
/// use sextant::core::{factor_graph::FactorGraph, key::symbol, values::Values};
/// use sextant::core::noise_model::{DiagonalNoiseModel, NoiseModel};
/// use sextant::factors::{BetweenFactor, PriorFactor};
/// use sextant::manifold::se2::SE2;
///
/// # fn example() -> sextant::error::SextantResult<()> {
/// let noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
/// let mut graph = FactorGraph::new();
/// graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), noise.clone())?);
/// graph.add(BetweenFactor::new(
///     symbol('x', 1),
///     symbol('x', 2),
///     SE2::from_xy_angle(1.0, 0.0, 0.0),
///     noise,
/// )?);
///
/// let mut values = Values::new();
/// values.insert(symbol('x', 1), SE2::identity())?;
/// values.insert(symbol('x', 2), SE2::from_xy_angle(1.0, 0.0, 0.0))?;
///
/// assert_eq!(graph.len(), 2);
/// assert!(graph.error(&values)? < 1e-12);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Default)]
pub struct FactorGraph {
    factors: Vec<Box<dyn Factor>>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a factor and returns its index.
    pub fn add(&mut self, factor: impl Factor + 'static) -> usize {
        self.add_boxed(Box::new(factor))
    }

    pub fn add_boxed(&mut self, factor: Box<dyn Factor>) -> usize {
        self.factors.push(factor);
        self.factors.len() - 1
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Factor> {
        self.factors.get(index).map(|f| f.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Factor> {
        self.factors.iter().map(|f| f.as_ref())
    }

    /// Sorted, distinct keys referenced by any factor.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .factors
            .iter()
            .flat_map(|f| f.keys().iter().copied())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Total number of residual rows.
    pub fn residual_dim(&self) -> usize {
        self.factors.iter().map(|f| f.dim()).sum()
    }

    /// Checks that every factor has keys and that every key has a value.
    pub fn validate(&self, values: &Values) -> CoreResult<()> {
        for (index, factor) in self.factors.iter().enumerate() {
            if factor.keys().is_empty() {
                return Err(CoreError::InvalidFactor(format!(
                    "factor {index} has no keys"
                ))
                .log());
            }
            if let Some(&key) = factor.keys().iter().find(|&&key| !values.exists(key)) {
                return Err(CoreError::KeyNotFound { key }.log());
            }
        }
        Ok(())
    }

    /// Total error `Σ factor.error(values)`.
    pub fn error(&self, values: &Values) -> CoreResult<f64> {
        #[cfg(feature = "parallel")]
        let errors: CoreResult<Vec<f64>> =
            self.factors.par_iter().map(|f| f.error(values)).collect();

        #[cfg(not(feature = "parallel"))]
        let errors: CoreResult<Vec<f64>> = self.factors.iter().map(|f| f.error(values)).collect();

        Ok(errors?.iter().sum())
    }

    /// Sparsity pattern of the stacked Jacobian under `ordering`.
    ///
    /// Each factor contributes a dense `dim × tangent_dim(key)` block per key, pushed row by
    /// row so that numeric values can later be supplied in the same order.
    ///
    /// For a chain `Prior(x1)`, `Between(x1, x2)`, `Between(x2, x3)` of SE(2) poses the
    /// Jacobian is 9×9 with 45 structural non-zeros.
    pub fn build_symbolic_structure(&self, ordering: &Ordering) -> CoreResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();
        let mut row_offsets = Vec::with_capacity(self.factors.len());
        let mut row = 0;

        for factor in &self.factors {
            row_offsets.push(row);
            let columns = factor
                .keys()
                .iter()
                .map(|&key| column_block(ordering, key))
                .collect::<CoreResult<Vec<_>>>()?;

            for r in row..row + factor.dim() {
                for &(offset, dim) in &columns {
                    for c in offset..offset + dim {
                        indices.push(Pair::new(r, c));
                    }
                }
            }
            row += factor.dim();
        }

        let (pattern, order) =
            SymbolicSparseColMat::try_new_from_indices(row, ordering.total_dim(), &indices)
                .map_err(|e| {
                    CoreError::SymbolicStructure(
                        "Failed to build symbolic sparse matrix structure".to_string(),
                    )
                    .log_with_source(e)
                })?;

        Ok(SymbolicStructure {
            pattern,
            order,
            row_offsets,
        })
    }

    /// Linearizes with the natural ordering and a fresh symbolic structure.
    pub fn linearize(&self, values: &Values) -> CoreResult<LinearSystem> {
        let ordering = Ordering::natural(self, values)?;
        let structure = self.build_symbolic_structure(&ordering)?;
        self.linearize_with(values, &ordering, &structure)
    }

    /// Linearizes every factor at `values` and assembles `A` and `r` on a precomputed pattern.
    ///
    /// Factors are evaluated in parallel; their blocks are then written sequentially into
    /// disjoint row ranges.
    pub fn linearize_with(
        &self,
        values: &Values,
        ordering: &Ordering,
        structure: &SymbolicStructure,
    ) -> CoreResult<LinearSystem> {
        #[cfg(feature = "parallel")]
        let linearized: CoreResult<Vec<JacobianFactor>> = self
            .factors
            .par_iter()
            .map(|f| f.linearize(values))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let linearized: CoreResult<Vec<JacobianFactor>> =
            self.factors.iter().map(|f| f.linearize(values)).collect();

        let linearized = linearized?;

        let mut residual = Mat::<f64>::zeros(structure.nrows(), 1);
        let mut jacobian_values = Vec::with_capacity(structure.nnz());

        for ((factor, block), &row_offset) in self
            .factors
            .iter()
            .zip(&linearized)
            .zip(&structure.row_offsets)
        {
            check_block_shapes(factor.as_ref(), block, ordering)?;

            for (i, &value) in block.residual.iter().enumerate() {
                residual[(row_offset + i, 0)] = value;
            }
            for r in 0..block.dim() {
                for jacobian in &block.jacobians {
                    jacobian_values.extend(jacobian.row(r).iter().copied());
                }
            }
        }

        let jacobian = SparseColMat::new_from_argsort(
            structure.pattern.clone(),
            &structure.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to create sparse Jacobian from argsort".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok(LinearSystem { jacobian, residual })
    }
}

fn column_block(ordering: &Ordering, key: Key) -> CoreResult<(usize, usize)> {
    ordering
        .offset(key)
        .zip(ordering.dim(key))
        .ok_or_else(|| CoreError::KeyNotFound { key }.log())
}

fn check_block_shapes(
    factor: &dyn Factor,
    block: &JacobianFactor,
    ordering: &Ordering,
) -> CoreResult<()> {
    if block.dim() != factor.dim() {
        return Err(CoreError::dimension_mismatch(
            "factor residual",
            factor.dim(),
            block.dim(),
        )
        .log());
    }
    for (&key, jacobian) in factor.keys().iter().zip(&block.jacobians) {
        let (_, dim) = column_block(ordering, key)?;
        if jacobian.shape() != (factor.dim(), dim) {
            return Err(CoreError::dimension_mismatch(
                format!("Jacobian block for {}", format_key(key)),
                factor.dim() * dim,
                jacobian.nrows() * jacobian.ncols(),
            )
            .log());
        }
    }
    Ok(())
}

impl Display for FactorGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Factor graph with {} factors:", self.factors.len())?;
        for (index, factor) in self.factors.iter().enumerate() {
            writeln!(f, "  [{index}] {}", factor.describe())?;
        }
        Ok(())
    }
}
