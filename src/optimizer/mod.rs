//! Nonlinear optimization of factor graphs.
//!
//! [`LevenbergMarquardt`] is the only optimizer. This module holds the types it shares with
//! callers: the status state machine, the result record, the convergence rule and the
//! cancellation handle.
//!
//! ```text
//! Initialized ──optimize()──▶ Iterating ──▶ Converged
//!                                 │     ├──▶ MaxIterationsReached
//!                                 │     ├──▶ Failed(reason)
//!                                 │     └──▶ UserTerminated / Timeout
//!                                 └── iterate() until terminal
//! ```

use crate::core::key::Key;
use crate::core::values::Values;
use crate::linalg::LinAlgError;
use faer::Mat;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{
    IterationStats, LevenbergMarquardt, LevenbergMarquardtConfig, LevenbergMarquardtSummary,
};

pub use crate::observers::{OptObserver, OptObserverVec};

/// Optimizer-specific error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    /// Configuration values are out of range
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Linear system solve failed for a reason other than singularity
    #[error("Linear system solve failed: {0}")]
    LinearSolveFailed(String),

    /// NaN or Inf in error, gradient or step
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// config.validate().map_err(|e| e.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// solver
    ///     .solve_augmented_equation(&r, &a, lambda, damping)
    ///     .map_err(|e| OptimizerError::LinearSolveFailed(e.to_string()).log_with_source(e))?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Why an optimizer gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// λ grew past `lambda_upper_bound` without producing an acceptable step.
    DampingLimitExceeded,
    /// More than `max_consecutive_rejections` trial steps in a row increased the error.
    TooManyRejections,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DampingLimitExceeded => write!(f, "damping limit exceeded"),
            FailureReason::TooManyRejections => write!(f, "too many consecutive rejections"),
        }
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Constructed, no iteration run yet
    Initialized,
    /// At least one iteration run, not yet terminal
    Iterating,
    /// Convergence rule satisfied
    Converged,
    /// No acceptable step could be found
    Failed(FailureReason),
    /// Iteration limit hit; values are the best found
    MaxIterationsReached,
    /// Cancelled through a [`CancellationToken`]
    UserTerminated,
    /// Wall-clock limit hit
    Timeout,
}

impl OptimizationStatus {
    /// Terminal states are never left; further `optimize()` calls return the stored result.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OptimizationStatus::Initialized | OptimizationStatus::Iterating
        )
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, OptimizationStatus::Converged)
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Initialized => write!(f, "Initialized"),
            OptimizationStatus::Iterating => write!(f, "Iterating"),
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::Failed(reason) => write!(f, "Failed: {reason}"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::UserTerminated => write!(f, "User terminated"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Which clause of the convergence rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceReason {
    /// `new_error ≤ error_tolerance`
    ErrorThreshold,
    /// `current − new ≤ absolute_error_tolerance`
    AbsoluteDecrease,
    /// `(current − new) / current ≤ relative_error_tolerance`
    RelativeDecrease,
}

impl Display for ConvergenceReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceReason::ErrorThreshold => write!(f, "error below threshold"),
            ConvergenceReason::AbsoluteDecrease => write!(f, "absolute decrease below tolerance"),
            ConvergenceReason::RelativeDecrease => write!(f, "relative decrease below tolerance"),
        }
    }
}

/// Convergence test applied after every accepted step.
///
/// Returns the first clause that holds, checked in the order error threshold, absolute
/// decrease, relative decrease.
///
/// ```
/// use sextant::optimizer::{ConvergenceReason, check_convergence};
///
/// assert_eq!(check_convergence(1e-5, 1e-5, 0.0, 10.0, 5.0), None);
/// assert_eq!(
///     check_convergence(1e-5, 1e-5, 0.0, 1e-9, 1e-12),
///     Some(ConvergenceReason::AbsoluteDecrease)
/// );
/// ```
pub fn check_convergence(
    relative_error_tolerance: f64,
    absolute_error_tolerance: f64,
    error_tolerance: f64,
    current_error: f64,
    new_error: f64,
) -> Option<ConvergenceReason> {
    if new_error <= error_tolerance {
        return Some(ConvergenceReason::ErrorThreshold);
    }

    let absolute_decrease = current_error - new_error;
    if absolute_decrease <= absolute_error_tolerance {
        return Some(ConvergenceReason::AbsoluteDecrease);
    }

    if current_error > 0.0 && absolute_decrease / current_error <= relative_error_tolerance {
        return Some(ConvergenceReason::RelativeDecrease);
    }

    None
}

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// `‖Aᵀr‖` at the last linearization point
    pub final_gradient_norm: f64,
    /// `‖δ‖` of the last accepted step
    pub final_parameter_update_norm: f64,
    /// Graph error evaluations, including the initial one
    pub cost_evaluations: usize,
    /// Linearizations of the graph
    pub jacobian_evaluations: usize,
    /// Set when the status is `Converged`
    pub reason: Option<ConvergenceReason>,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )?;
        if let Some(reason) = self.reason {
            write!(f, ", Reason: {reason}")?;
        }
        Ok(())
    }
}

/// Result of an optimization run.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Best values found (the last accepted iterate)
    pub values: Values,
    /// Terminal status
    pub status: OptimizationStatus,
    /// Graph error at the initial values
    pub initial_error: f64,
    /// Graph error at `values`
    pub final_error: f64,
    /// Accepted iterations
    pub iterations: usize,
    /// Total time spent in `optimize()`
    pub elapsed_time: time::Duration,
    pub convergence_info: Option<ConvergenceInfo>,
    /// Marginal covariance per key in tangent coordinates.
    ///
    /// `None` unless `compute_covariances` is enabled in the optimizer configuration.
    pub covariances: Option<HashMap<Key, Mat<f64>>>,
}

impl SolverResult {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Shared flag that stops an optimizer at the next iteration boundary.
///
/// Cloning yields a handle to the same flag, so a token can be handed to another thread
/// while the optimizer runs.
///
/// ```
/// use sextant::optimizer::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Clears the flag so the token can be reused for another run.
    pub fn reset(&self) {
        self.cancelled.store(false, AtomicOrdering::SeqCst);
    }
}
