//! Error types for the sextant library
//!
//! Every module owns a `thiserror` enum; [`SextantError`] is the top-level error returned by
//! the public API and wraps them transparently, so `?` converts module errors automatically
//! and the full source chain stays inspectable.
//!
//! ```text
//! SextantError::Core(
//!     CoreError::KeyNotFound { key: x4 }
//! )
//! ```

use crate::{
    core::CoreError, linalg::LinAlgError, manifold::ManifoldError, optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the sextant library
pub type SextantResult<T> = Result<T, SextantError>;

/// Main error type for the sextant library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = optimizer.optimize() {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum SextantError {
    /// Graph construction and evaluation errors (keys, values, factors, noise models)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Manifold operation errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),
}

impl SextantError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// One line per error, from this error down to the root cause.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// ```rust,ignore
    /// error!("Optimization failed: {}", err.chain_compact());
    /// // Output: "Linear algebra error: Singular matrix → Singular matrix"
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::symbol;

    #[test]
    fn test_sextant_error_display_is_transparent() {
        let error = SextantError::from(CoreError::KeyNotFound {
            key: symbol('x', 4),
        });
        assert_eq!(error.to_string(), "Key not found: x4");
    }

    #[test]
    fn test_sextant_error_chain() {
        let error = SextantError::from(OptimizerError::from(LinAlgError::SingularMatrix));
        let chain = error.chain();
        assert!(chain.starts_with("Linear algebra error"));
        assert!(chain.contains("  → "));

        let compact = error.chain_compact();
        assert!(compact.contains(" → "));
        assert!(!compact.contains('\n'));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let manifold_error = ManifoldError::InvalidTangentDimension {
            expected: 3,
            actual: 2,
        };

        let error: SextantError = manifold_error.into();
        assert!(matches!(error, SextantError::Manifold(_)));

        let result: SextantResult<()> = Err(LinAlgError::SingularMatrix.into());
        assert!(matches!(result, Err(SextantError::LinearAlgebra(_))));
    }
}
