//! Core building blocks of the factor-graph formulation.
//!
//! - Keys and symbols identifying variables
//! - Value containers with manifold retraction
//! - Noise models, robust losses and the corrector that applies them
//! - The factor graph, its variable ordering and sparse linearization
//! - Marginal covariances at a solution

pub mod corrector;
pub mod factor_graph;
pub mod key;
pub mod loss_functions;
pub mod marginals;
pub mod noise_model;
pub mod ordering;
pub mod values;

use crate::core::key::{Key, format_key};
use thiserror::Error;
use tracing::error;

/// Errors raised while building or evaluating a factor graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A value was inserted under a key that is already present.
    #[error("Duplicate key: {} already has a value", format_key(.key))]
    DuplicateKey { key: Key },

    /// A key was looked up that has no value.
    #[error("Key not found: {}", format_key(.key))]
    KeyNotFound { key: Key },

    /// A value was accessed as the wrong variable type.
    #[error("Type mismatch for {}: expected {expected}, found {actual}", format_key(.key))]
    TypeMismatch {
        key: Key,
        expected: &'static str,
        actual: &'static str,
    },

    /// A retraction increment contained NaN or infinite entries.
    #[error("Non-finite increment for {}", format_key(.key))]
    NonFiniteValue { key: Key },

    /// A vector or matrix had the wrong size.
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Noise model parameters are not usable (non-positive sigma, non-SPD covariance, ...).
    #[error("Invalid noise model: {0}")]
    InvalidNoiseModel(String),

    /// A factor was constructed with inconsistent arguments.
    #[error("Invalid factor: {0}")]
    InvalidFactor(String),

    /// Symbolic sparsity structure construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Factor linearization failed
    #[error("Factor linearization failed: {0}")]
    FactorLinearization(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// values.at(key).map_err(|e| e.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the third-party error that caused it
    ///
    /// # Example
    /// ```ignore
    /// SparseColMat::new_from_argsort(pattern, &order, &values).map_err(|e| {
    ///     CoreError::SymbolicStructure("Failed to assemble Jacobian".to_string())
    ///         .log_with_source(e)
    /// })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }

    pub(crate) fn dimension_mismatch(
        context: impl Into<String>,
        expected: usize,
        actual: usize,
    ) -> Self {
        CoreError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::symbol;

    #[test]
    fn test_core_error_display_uses_key_formatter() {
        let err = CoreError::KeyNotFound {
            key: symbol('x', 3),
        };
        assert_eq!(err.to_string(), "Key not found: x3");

        let err = CoreError::DuplicateKey { key: 7 };
        assert_eq!(err.to_string(), "Duplicate key: 7 already has a value");

        let err = CoreError::TypeMismatch {
            key: 2,
            expected: "Pose2",
            actual: "Vector",
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch for 2: expected Pose2, found Vector"
        );
    }

    #[test]
    fn test_dimension_mismatch_helper() {
        let err = CoreError::dimension_mismatch("whiten", 3, 2);
        assert_eq!(
            err.to_string(),
            "Dimension mismatch in whiten: expected 3, got 2"
        );
    }

    #[test]
    fn test_log_returns_self() {
        let err = CoreError::InvalidFactor("same key twice".to_string());
        assert_eq!(err.clone().log(), err);
    }
}
