//! Levenberg-Marquardt optimization of a factor graph.
//!
//! Each outer iteration linearizes the graph at the current values and solves the damped
//! normal equations
//!
//! ```text
//! (AᵀA + λ·D)·δ = −Aᵀr
//! ```
//!
//! where `A` and `r` are the whitened Jacobian and residual and `D` is `I` or the clamped
//! diagonal of `AᵀA`. The trial values `x ⊞ δ` are accepted when they lower the graph error;
//! otherwise λ grows and the same linearization is solved again.
//!
//! ## Damping update
//!
//! With `use_fixed_lambda_factor` (the default) λ is divided by `lambda_factor` after an
//! accepted step and multiplied by it after a rejection. Otherwise Nielsen's rule is used:
//!
//! ```text
//! accepted: λ ← λ·max(1/3, 1 − (2ρ − 1)³),  ν ← 2
//! rejected: λ ← λ·ν,                        ν ← 2ν
//! ```
//!
//! with `ρ = (actual reduction) / (predicted reduction)` and the predicted reduction
//! `½(‖r‖² − ‖r + Aδ‖²)` of the linear model.
//!
//! ## Termination
//!
//! - `Converged`: after an accepted step, the new error is below `error_tolerance`, or the
//!   absolute or relative decrease is below its tolerance
//! - `MaxIterationsReached`: `max_iterations` steps accepted without converging
//! - `Failed(DampingLimitExceeded)`: λ grew past `lambda_upper_bound`
//! - `Failed(TooManyRejections)`: more than `max_consecutive_rejections` rejected trials
//! - `UserTerminated` / `Timeout`: checked at iteration boundaries
//!
//! # Example
//!
//! ```
//! use sextant::core::{factor_graph::FactorGraph, key::symbol, values::Values};
//! use sextant::core::noise_model::{DiagonalNoiseModel, NoiseModel};
//! use sextant::factors::{BetweenFactor, PriorFactor};
//! use sextant::manifold::se2::SE2;
//! use sextant::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
//! let odometry_noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
//!
//! let mut graph = FactorGraph::new();
//! graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
//! graph.add(BetweenFactor::new(
//!     symbol('x', 1),
//!     symbol('x', 2),
//!     SE2::from_xy_angle(2.0, 0.0, 0.0),
//!     odometry_noise,
//! )?);
//!
//! let mut initial = Values::new();
//! initial.insert(symbol('x', 1), SE2::from_xy_angle(0.5, 0.0, 0.2))?;
//! initial.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, -0.2))?;
//!
//! let config = LevenbergMarquardtConfig::new().with_max_iterations(50);
//! let mut optimizer = LevenbergMarquardt::new(&graph, initial, config)?;
//! let result = optimizer.optimize()?;
//!
//! assert_eq!(result.status, OptimizationStatus::Converged);
//! let x2 = result.values.get::<SE2>(symbol('x', 2))?;
//! assert!((x2.x() - 2.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use faer::Mat;
use tracing::{debug, warn};
use web_time::{Duration, Instant};

use crate::core::{
    factor_graph::{FactorGraph, LinearSystem, SymbolicStructure},
    key::Key,
    marginals::Marginals,
    ordering::Ordering,
    values::Values,
};
use crate::error::SextantResult;
use crate::linalg::{
    DampingMatrix, LinAlgError, LinearSolverType, SparseLinearSolver, create_linear_solver,
};
use crate::optimizer::{
    CancellationToken, ConvergenceInfo, ConvergenceReason, FailureReason, OptObserver,
    OptObserverVec, OptimizationStatus, OptimizerError, OptimizerResult, SolverResult,
    check_convergence,
};

/// Summary statistics for a Levenberg-Marquardt run.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    pub initial_error: f64,
    pub final_error: f64,
    /// Accepted iterations
    pub iterations: usize,
    /// Trial steps that lowered the error
    pub successful_steps: usize,
    /// Trial steps that were rejected (including singular solves)
    pub unsuccessful_steps: usize,
    pub final_lambda: f64,
    pub max_gradient_norm: f64,
    pub final_gradient_norm: f64,
    pub max_parameter_update_norm: f64,
    pub final_parameter_update_norm: f64,
    pub total_time: Duration,
    pub average_time_per_iteration: Duration,
    pub iteration_history: Vec<IterationStats>,
    pub status: OptimizationStatus,
    pub convergence_reason: Option<ConvergenceReason>,
}

impl Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Levenberg-Marquardt Final Result")?;

        if self.status.is_converged() {
            match self.convergence_reason {
                Some(reason) => writeln!(f, "CONVERGED ({reason})")?,
                None => writeln!(f, "CONVERGED")?,
            }
        } else {
            writeln!(f, "NOT CONVERGED ({})", self.status)?;
        }

        writeln!(f)?;
        writeln!(f, "Error:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_error)?;
        writeln!(f, "  Final:     {:.6e}", self.final_error)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_error - self.final_error,
            100.0 * (self.initial_error - self.final_error) / self.initial_error.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        let trials = (self.successful_steps + self.unsuccessful_steps).max(1) as f64;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / trials
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / trials
        )?;
        writeln!(f, "  Final lambda:       {:.2e}", self.final_lambda)?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_gradient_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(f, "Parameter Update:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_parameter_update_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_parameter_update_norm)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Per-iteration statistics (Ceres-style table rows).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number, 0 for the initial state
    pub iteration: usize,
    /// Graph error after the iteration
    pub error: f64,
    /// Decrease of the error in this iteration
    pub error_change: f64,
    /// ‖Aᵀr‖ at the linearization point
    pub gradient_norm: f64,
    /// ‖δ‖ of the accepted step
    pub step_norm: f64,
    /// Gain ratio ρ of the accepted step
    pub gain_ratio: f64,
    /// λ the accepted step was solved with
    pub lambda: f64,
    /// Trials rejected before the accepted one
    pub rejections: usize,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>7}  {:>11}  {:>13}",
            "iter",
            "error",
            "error_change",
            "|gradient|",
            "|step|",
            "rho",
            "lambda",
            "rejects",
            "iter_time",
            "total_time"
        );
    }

    /// Print single iteration line with scientific notation
    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.error,
            self.error_change,
            self.gradient_norm,
            self.step_norm,
            self.gain_ratio,
            self.lambda,
            self.rejections,
            self.iter_time_ms,
            self.total_time_ms
        );
    }
}

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// ```
/// use sextant::linalg::LinearSolverType;
/// use sextant::optimizer::LevenbergMarquardtConfig;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_max_iterations(20)
///     .with_relative_error_tolerance(1e-8)
///     .with_lambda_initial(1e-3)
///     .with_linear_solver_type(LinearSolverType::SparseQR);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    /// Maximum number of accepted iterations
    pub max_iterations: usize,
    /// Converged when `(current − new) / current` falls to this value
    pub relative_error_tolerance: f64,
    /// Converged when `current − new` falls to this value
    pub absolute_error_tolerance: f64,
    /// Converged when the error itself falls to this value
    pub error_tolerance: f64,
    pub lambda_initial: f64,
    /// Multiplier for the fixed λ schedule
    pub lambda_factor: f64,
    /// λ above this bound fails the optimization
    pub lambda_upper_bound: f64,
    /// Floor applied after decreasing λ
    pub lambda_lower_bound: f64,
    pub max_consecutive_rejections: usize,
    /// Fixed up/down factor when true, Nielsen's gain-ratio update when false
    pub use_fixed_lambda_factor: bool,
    /// Damp with the clamped diagonal of `AᵀA` instead of the identity
    pub diagonal_damping: bool,
    pub min_diagonal: f64,
    pub max_diagonal: f64,
    pub linear_solver_type: LinearSolverType,
    /// Wall-clock limit checked at iteration boundaries
    pub timeout: Option<Duration>,
    /// Attach per-key marginal covariances to the result
    pub compute_covariances: bool,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            relative_error_tolerance: 1e-5,
            absolute_error_tolerance: 1e-5,
            error_tolerance: 0.0,
            lambda_initial: 1e-5,
            lambda_factor: 10.0,
            lambda_upper_bound: 1e5,
            lambda_lower_bound: 0.0,
            max_consecutive_rejections: 32,
            use_fixed_lambda_factor: true,
            diagonal_damping: true,
            min_diagonal: 1e-6,
            max_diagonal: 1e32,
            linear_solver_type: LinearSolverType::default(),
            timeout: None,
            compute_covariances: false,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_relative_error_tolerance(mut self, tolerance: f64) -> Self {
        self.relative_error_tolerance = tolerance;
        self
    }

    pub fn with_absolute_error_tolerance(mut self, tolerance: f64) -> Self {
        self.absolute_error_tolerance = tolerance;
        self
    }

    pub fn with_error_tolerance(mut self, tolerance: f64) -> Self {
        self.error_tolerance = tolerance;
        self
    }

    pub fn with_lambda_initial(mut self, lambda: f64) -> Self {
        self.lambda_initial = lambda;
        self
    }

    pub fn with_lambda_factor(mut self, factor: f64) -> Self {
        self.lambda_factor = factor;
        self
    }

    /// Set the λ range as `(lower, upper)`.
    pub fn with_lambda_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lambda_lower_bound = lower;
        self.lambda_upper_bound = upper;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, max_rejections: usize) -> Self {
        self.max_consecutive_rejections = max_rejections;
        self
    }

    pub fn with_fixed_lambda_factor(mut self, fixed: bool) -> Self {
        self.use_fixed_lambda_factor = fixed;
        self
    }

    pub fn with_diagonal_damping(mut self, diagonal_damping: bool) -> Self {
        self.diagonal_damping = diagonal_damping;
        self
    }

    /// Clamp range for the entries of `diag(AᵀA)` used as damping.
    pub fn with_diagonal_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_diagonal = min;
        self.max_diagonal = max;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_compute_covariances(mut self, compute_covariances: bool) -> Self {
        self.compute_covariances = compute_covariances;
        self
    }

    /// Damping term selected by `diagonal_damping`.
    pub fn damping_matrix(&self) -> DampingMatrix {
        if self.diagonal_damping {
            DampingMatrix::Diagonal {
                min_diagonal: self.min_diagonal,
                max_diagonal: self.max_diagonal,
            }
        } else {
            DampingMatrix::Identity
        }
    }

    /// Checks ranges that would otherwise stall or break the damping schedule.
    pub fn validate(&self) -> OptimizerResult<()> {
        let non_negative = [
            ("relative_error_tolerance", self.relative_error_tolerance),
            ("absolute_error_tolerance", self.absolute_error_tolerance),
            ("error_tolerance", self.error_tolerance),
            ("lambda_lower_bound", self.lambda_lower_bound),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) || value.is_infinite() {
                return Err(OptimizerError::InvalidParameters(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !(self.lambda_initial > 0.0) || !self.lambda_initial.is_finite() {
            return Err(OptimizerError::InvalidParameters(format!(
                "lambda_initial must be positive, got {}",
                self.lambda_initial
            )));
        }
        if !(self.lambda_factor > 1.0) || !self.lambda_factor.is_finite() {
            return Err(OptimizerError::InvalidParameters(format!(
                "lambda_factor must be greater than 1, got {}",
                self.lambda_factor
            )));
        }
        if !(self.lambda_upper_bound >= self.lambda_initial)
            || self.lambda_lower_bound > self.lambda_upper_bound
        {
            return Err(OptimizerError::InvalidParameters(format!(
                "lambda bounds [{}, {}] must contain lambda_initial {}",
                self.lambda_lower_bound, self.lambda_upper_bound, self.lambda_initial
            )));
        }
        if self.diagonal_damping && !(self.min_diagonal > 0.0 && self.min_diagonal <= self.max_diagonal)
        {
            return Err(OptimizerError::InvalidParameters(format!(
                "diagonal bounds [{}, {}] must be positive and ordered",
                self.min_diagonal, self.max_diagonal
            )));
        }
        Ok(())
    }

    /// Print configuration parameters (debug level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Levenberg-Marquardt\n  Linear solver: {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Relative tolerance:  {:.2e}\n  Absolute tolerance:  {:.2e}\n  Error tolerance:     {:.2e}\n  Timeout:             {:?}\n  Damping Parameters:\n  Initial lambda:      {:.2e}\n  Lambda range:        [{:.2e}, {:.2e}]\n  Lambda schedule:     {}\n  Max rejections:      {}\n  Damping matrix:      {}\n  Compute covariances: {}",
            self.linear_solver_type,
            self.max_iterations,
            self.relative_error_tolerance,
            self.absolute_error_tolerance,
            self.error_tolerance,
            self.timeout,
            self.lambda_initial,
            self.lambda_lower_bound,
            self.lambda_upper_bound,
            if self.use_fixed_lambda_factor {
                format!("fixed x{}", self.lambda_factor)
            } else {
                "Nielsen".to_string()
            },
            self.max_consecutive_rejections,
            self.damping_matrix(),
            if self.compute_covariances {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
}

/// Outcome of one solved trial step.
struct StepResult {
    step: Mat<f64>,
    gradient_norm: f64,
    predicted_reduction: f64,
}

/// Levenberg-Marquardt optimizer bound to one factor graph.
///
/// Owns a copy of the values being optimized; the caller's container is never modified.
/// The variable ordering, symbolic structure and symbolic factorization are computed once in
/// [`new`](Self::new) and reused by every iteration.
pub struct LevenbergMarquardt<'g> {
    graph: &'g FactorGraph,
    config: LevenbergMarquardtConfig,
    ordering: Ordering,
    structure: SymbolicStructure,
    linear_solver: Box<dyn SparseLinearSolver>,
    observers: OptObserverVec,
    cancellation: CancellationToken,

    values: Values,
    initial_error: f64,
    current_error: f64,
    lambda: f64,
    /// Nielsen's growth factor ν
    nu: f64,
    iterations: usize,
    status: OptimizationStatus,
    convergence_reason: Option<ConvergenceReason>,
    consecutive_rejections: usize,

    cost_evaluations: usize,
    jacobian_evaluations: usize,
    successful_steps: usize,
    unsuccessful_steps: usize,
    max_gradient_norm: f64,
    final_gradient_norm: f64,
    max_parameter_update_norm: f64,
    final_parameter_update_norm: f64,
    iteration_history: Vec<IterationStats>,
    start_time: Option<Instant>,
    elapsed: Duration,
    result: Option<SolverResult>,
}

impl<'g> LevenbergMarquardt<'g> {
    /// Validates the graph against `initial`, builds the ordering, symbolic structure and
    /// linear solver, and evaluates the initial error.
    pub fn new(
        graph: &'g FactorGraph,
        initial: Values,
        config: LevenbergMarquardtConfig,
    ) -> SextantResult<Self> {
        config.validate().map_err(|e| e.log())?;
        graph.validate(&initial)?;

        let ordering = Ordering::natural(graph, &initial)?;
        let structure = graph.build_symbolic_structure(&ordering)?;
        let linear_solver = create_linear_solver(config.linear_solver_type);
        let initial_error = graph.error(&initial)?;

        if !initial_error.is_finite() {
            return Err(OptimizerError::NumericalInstability(format!(
                "initial error is {initial_error}"
            ))
            .log()
            .into());
        }

        debug!(
            "LM initialized: {} factors, {} variables, {}x{} Jacobian with {} non-zeros, initial error {:.6e}",
            graph.len(),
            ordering.len(),
            structure.nrows(),
            structure.ncols(),
            structure.nnz(),
            initial_error
        );

        Ok(Self {
            graph,
            lambda: config.lambda_initial,
            config,
            ordering,
            structure,
            linear_solver,
            observers: OptObserverVec::new(),
            cancellation: CancellationToken::new(),
            values: initial,
            initial_error,
            current_error: initial_error,
            nu: 2.0,
            iterations: 0,
            status: OptimizationStatus::Initialized,
            convergence_reason: None,
            consecutive_rejections: 0,
            cost_evaluations: 1,
            jacobian_evaluations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            max_gradient_norm: 0.0,
            final_gradient_norm: 0.0,
            max_parameter_update_norm: 0.0,
            final_parameter_update_norm: 0.0,
            iteration_history: Vec::new(),
            start_time: None,
            elapsed: Duration::ZERO,
            result: None,
        })
    }

    /// Add an observer notified after every accepted iteration.
    pub fn add_observer(&mut self, observer: impl OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Handle that stops this optimizer at the next iteration boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Current estimate (the last accepted iterate).
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Graph error at [`values`](Self::values).
    pub fn error(&self) -> f64 {
        self.current_error
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn status(&self) -> OptimizationStatus {
        self.status
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// Runs until a terminal state and returns the result.
    ///
    /// Calling this again on a finished optimizer returns the stored result unchanged.
    pub fn optimize(&mut self) -> SextantResult<SolverResult> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }

        let start = *self.start_time.get_or_insert_with(Instant::now);

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
            IterationStats {
                iteration: 0,
                error: self.current_error,
                error_change: 0.0,
                gradient_norm: 0.0,
                step_norm: 0.0,
                gain_ratio: 0.0,
                lambda: self.lambda,
                rejections: 0,
                iter_time_ms: 0.0,
                total_time_ms: 0.0,
            }
            .print_line();
        }

        if self.status == OptimizationStatus::Initialized
            && self.current_error <= self.config.error_tolerance
        {
            debug!("Initial error below tolerance, nothing to optimize");
            self.status = OptimizationStatus::Converged;
            self.convergence_reason = Some(ConvergenceReason::ErrorThreshold);
        }

        while !self.status.is_terminal() {
            self.iterate()?;
        }
        self.elapsed = start.elapsed();

        let covariances = if self.config.compute_covariances {
            self.compute_covariances()
        } else {
            None
        };

        let result = SolverResult {
            values: self.values.clone(),
            status: self.status,
            initial_error: self.initial_error,
            final_error: self.current_error,
            iterations: self.iterations,
            elapsed_time: self.elapsed,
            convergence_info: Some(ConvergenceInfo {
                final_gradient_norm: self.final_gradient_norm,
                final_parameter_update_norm: self.final_parameter_update_norm,
                cost_evaluations: self.cost_evaluations,
                jacobian_evaluations: self.jacobian_evaluations,
                reason: self.convergence_reason,
            }),
            covariances,
        };

        debug!("{}", self.summary());
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Performs one outer iteration and returns the resulting status.
    ///
    /// Linearizes once, then solves with increasing λ until a step lowers the error or a
    /// failure state is reached. A no-op on a terminal optimizer.
    pub fn iterate(&mut self) -> SextantResult<OptimizationStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        let start = *self.start_time.get_or_insert_with(Instant::now);

        if let Some(status) = self.check_boundary(start) {
            self.status = status;
            return Ok(status);
        }
        self.status = OptimizationStatus::Iterating;

        let iter_start = Instant::now();
        let system = self
            .graph
            .linearize_with(&self.values, &self.ordering, &self.structure)?;
        self.jacobian_evaluations += 1;

        // Predicted reduction of the least damped solve at this linearization point.
        let mut least_damped_reduction: Option<f64> = None;

        loop {
            let lambda = self.lambda;
            let step_result = match self.compute_step(&system) {
                Ok(step_result) => step_result,
                Err(OptimizerError::LinAlg(LinAlgError::SingularMatrix)) => {
                    warn!("Singular system at lambda {lambda:.3e}, increasing damping");
                    self.unsuccessful_steps += 1;
                    if let Some(status) = self.reject_step() {
                        return Ok(self.finish(status));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let model_reduction =
                *least_damped_reduction.get_or_insert(step_result.predicted_reduction);

            let trial = self
                .values
                .retract_ordered(step_result.step.as_ref(), &self.ordering)?;
            let trial_error = self.graph.error(&trial)?;
            self.cost_evaluations += 1;

            let step_norm = step_result.step.norm_l2();
            self.final_gradient_norm = step_result.gradient_norm;
            self.max_gradient_norm = self.max_gradient_norm.max(step_result.gradient_norm);

            if trial_error.is_finite() && trial_error < self.current_error {
                let previous_error = self.current_error;
                let rho = gain_ratio(
                    previous_error,
                    trial_error,
                    step_result.predicted_reduction,
                );

                self.values = trial;
                self.current_error = trial_error;
                self.iterations += 1;
                self.successful_steps += 1;
                let rejections = std::mem::take(&mut self.consecutive_rejections);
                self.final_parameter_update_norm = step_norm;
                self.max_parameter_update_norm = self.max_parameter_update_norm.max(step_norm);
                self.decrease_lambda(rho);

                let stats = IterationStats {
                    iteration: self.iterations,
                    error: trial_error,
                    error_change: previous_error - trial_error,
                    gradient_norm: step_result.gradient_norm,
                    step_norm,
                    gain_ratio: rho,
                    lambda,
                    rejections,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
                if tracing::enabled!(tracing::Level::DEBUG) {
                    stats.print_line();
                }
                self.iteration_history.push(stats);

                self.observers.set_iteration_metrics(
                    trial_error,
                    step_result.gradient_norm,
                    Some(lambda),
                    step_norm,
                    Some(rho),
                );
                self.observers.notify(&self.values, self.iterations);

                let status = if let Some(reason) = check_convergence(
                    self.config.relative_error_tolerance,
                    self.config.absolute_error_tolerance,
                    self.config.error_tolerance,
                    previous_error,
                    trial_error,
                ) {
                    self.convergence_reason = Some(reason);
                    OptimizationStatus::Converged
                } else if self.iterations >= self.config.max_iterations {
                    OptimizationStatus::MaxIterationsReached
                } else {
                    OptimizationStatus::Iterating
                };
                return Ok(self.finish(status));
            }

            self.unsuccessful_steps += 1;

            // Stationary: neither the trial nor the least damped linear model lowers the error.
            if trial_error.is_finite()
                && (trial_error - self.current_error).abs() <= self.config.absolute_error_tolerance
                && model_reduction <= self.config.absolute_error_tolerance
            {
                debug!(
                    "Step rejected at a stationary point (error {:.6e}, predicted reduction {:.3e})",
                    self.current_error, model_reduction
                );
                self.convergence_reason = Some(ConvergenceReason::AbsoluteDecrease);
                return Ok(self.finish(OptimizationStatus::Converged));
            }

            debug!(
                "Step rejected: error {:.6e} -> {:.6e} at lambda {:.3e}",
                self.current_error, trial_error, lambda
            );
            if let Some(status) = self.reject_step() {
                return Ok(self.finish(status));
            }
        }
    }

    /// Summary of the run so far.
    pub fn summary(&self) -> LevenbergMarquardtSummary {
        let total_time = match (self.result.is_some(), self.start_time) {
            (false, Some(start)) => start.elapsed(),
            _ => self.elapsed,
        };
        LevenbergMarquardtSummary {
            initial_error: self.initial_error,
            final_error: self.current_error,
            iterations: self.iterations,
            successful_steps: self.successful_steps,
            unsuccessful_steps: self.unsuccessful_steps,
            final_lambda: self.lambda,
            max_gradient_norm: self.max_gradient_norm,
            final_gradient_norm: self.final_gradient_norm,
            max_parameter_update_norm: self.max_parameter_update_norm,
            final_parameter_update_norm: self.final_parameter_update_norm,
            total_time,
            average_time_per_iteration: if self.iterations > 0 {
                total_time / self.iterations as u32
            } else {
                Duration::ZERO
            },
            iteration_history: self.iteration_history.clone(),
            status: self.status,
            convergence_reason: self.convergence_reason,
        }
    }

    /// Cancellation, timeout and iteration limit, checked before linearizing.
    fn check_boundary(&self, start: Instant) -> Option<OptimizationStatus> {
        if self.cancellation.is_cancelled() {
            debug!("Optimization cancelled after {} iterations", self.iterations);
            return Some(OptimizationStatus::UserTerminated);
        }
        if let Some(timeout) = self.config.timeout
            && start.elapsed() >= timeout
        {
            warn!("Optimization timed out after {} iterations", self.iterations);
            return Some(OptimizationStatus::Timeout);
        }
        if self.iterations >= self.config.max_iterations {
            return Some(OptimizationStatus::MaxIterationsReached);
        }
        None
    }

    /// Solves the damped system at the current λ.
    fn compute_step(&mut self, system: &LinearSystem) -> OptimizerResult<StepResult> {
        let step = self
            .linear_solver
            .solve_augmented_equation(
                &system.residual,
                &system.jacobian,
                self.lambda,
                self.config.damping_matrix(),
            )
            .map_err(|e| match e {
                LinAlgError::SingularMatrix => OptimizerError::LinAlg(e),
                other => OptimizerError::LinearSolveFailed(other.to_string()).log_with_source(other),
            })?;

        let gradient_norm = self
            .linear_solver
            .get_gradient()
            .map(|g| g.norm_l2())
            .ok_or_else(|| {
                OptimizerError::NumericalInstability("Gradient not available".into()).log()
            })?;

        // ½(‖r‖² − ‖r + Aδ‖²)
        let a_step = &system.jacobian * &step;
        let linearized = &system.residual + &a_step;
        let predicted_reduction =
            0.5 * (system.residual.norm_l2().powi(2) - linearized.norm_l2().powi(2));

        Ok(StepResult {
            step,
            gradient_norm,
            predicted_reduction,
        })
    }

    fn decrease_lambda(&mut self, rho: f64) {
        if self.config.use_fixed_lambda_factor {
            self.lambda /= self.config.lambda_factor;
        } else {
            let coff = 2.0 * rho - 1.0;
            self.lambda *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            self.nu = 2.0;
        }
        self.lambda = self.lambda.max(self.config.lambda_lower_bound);
    }

    fn increase_lambda(&mut self) {
        if self.config.use_fixed_lambda_factor {
            self.lambda *= self.config.lambda_factor;
        } else {
            self.lambda *= self.nu;
            self.nu *= 2.0;
        }
    }

    /// Records a rejected trial; returns the failure status if the search must stop.
    fn reject_step(&mut self) -> Option<OptimizationStatus> {
        self.consecutive_rejections += 1;
        self.increase_lambda();

        if self.consecutive_rejections > self.config.max_consecutive_rejections {
            warn!(
                "Giving up after {} consecutive rejected steps",
                self.consecutive_rejections
            );
            return Some(OptimizationStatus::Failed(FailureReason::TooManyRejections));
        }
        if self.lambda > self.config.lambda_upper_bound {
            warn!(
                "Lambda {:.3e} exceeded upper bound {:.3e}",
                self.lambda, self.config.lambda_upper_bound
            );
            return Some(OptimizationStatus::Failed(
                FailureReason::DampingLimitExceeded,
            ));
        }
        None
    }

    fn finish(&mut self, status: OptimizationStatus) -> OptimizationStatus {
        self.status = status;
        if let Some(start) = self.start_time {
            self.elapsed = start.elapsed();
        }
        status
    }

    fn compute_covariances(&self) -> Option<HashMap<Key, Mat<f64>>> {
        let marginals =
            match Marginals::with_solver_type(self.graph, &self.values, self.config.linear_solver_type)
            {
                Ok(marginals) => marginals,
                Err(e) => {
                    warn!("Covariance computation failed: {}", e.chain_compact());
                    return None;
                }
            };

        let mut covariances = HashMap::with_capacity(self.ordering.len());
        for &key in self.ordering.keys() {
            match marginals.marginal_covariance(key) {
                Ok(cov) => {
                    covariances.insert(key, cov);
                }
                Err(e) => {
                    warn!("Covariance computation failed: {}", e.chain_compact());
                    return None;
                }
            }
        }
        Some(covariances)
    }
}

/// Gain ratio `ρ = actual / predicted`, guarded against a vanishing prediction.
fn gain_ratio(current_error: f64, new_error: f64, predicted_reduction: f64) -> f64 {
    let actual_reduction = current_error - new_error;
    if predicted_reduction.abs() < 1e-15 {
        if actual_reduction > 0.0 { 1.0 } else { 0.0 }
    } else {
        actual_reduction / predicted_reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoreResult, key::symbol};
    use crate::core::noise_model::{DiagonalNoiseModel, NoiseModel, UnitNoiseModel};
    use crate::error::SextantError;
    use crate::factors::{BetweenFactor, Factor, PriorFactor};
    use crate::manifold::{rn::Rn, se2::SE2};
    use nalgebra::{DMatrix, DVector};
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn odometry_graph() -> CoreResult<FactorGraph> {
        let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
        let odometry_noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
        let step = SE2::from_xy_angle(2.0, 0.0, 0.0);

        let mut graph = FactorGraph::new();
        graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
        graph.add(BetweenFactor::new(
            symbol('x', 1),
            symbol('x', 2),
            step.clone(),
            odometry_noise.clone(),
        )?);
        graph.add(BetweenFactor::new(
            symbol('x', 2),
            symbol('x', 3),
            step,
            odometry_noise,
        )?);
        Ok(graph)
    }

    fn odometry_values() -> CoreResult<Values> {
        let mut values = Values::new();
        values.insert(symbol('x', 1), SE2::from_xy_angle(0.5, 0.0, 0.2))?;
        values.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, -0.2))?;
        values.insert(symbol('x', 3), SE2::from_xy_angle(4.1, 0.1, 0.1))?;
        Ok(values)
    }

    /// `r = x − target` with a Jacobian of the wrong sign, so every step goes uphill.
    struct WrongSignFactor {
        keys: [Key; 1],
        target: f64,
        noise: Arc<dyn NoiseModel>,
    }

    impl Factor for WrongSignFactor {
        fn keys(&self) -> &[Key] {
            &self.keys
        }

        fn dim(&self) -> usize {
            1
        }

        fn noise_model(&self) -> &Arc<dyn NoiseModel> {
            &self.noise
        }

        fn evaluate(
            &self,
            values: &Values,
            compute_jacobians: bool,
        ) -> CoreResult<(DVector<f64>, Option<Vec<DMatrix<f64>>>)> {
            let x = values.get::<Rn>(self.keys[0])?.component(0);
            let residual = DVector::from_element(1, x - self.target);
            let jacobians = compute_jacobians.then(|| vec![DMatrix::from_element(1, 1, -1.0)]);
            Ok((residual, jacobians))
        }
    }

    fn uphill_problem() -> CoreResult<(FactorGraph, Values)> {
        let mut graph = FactorGraph::new();
        graph.add(WrongSignFactor {
            keys: [1],
            target: 1.0,
            noise: UnitNoiseModel::new(1)?.into_shared(),
        });
        let mut values = Values::new();
        values.insert(1, Rn::from_slice(&[11.0]))?;
        Ok((graph, values))
    }

    #[test]
    fn test_config_defaults() {
        let config = LevenbergMarquardtConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.relative_error_tolerance, 1e-5);
        assert_eq!(config.absolute_error_tolerance, 1e-5);
        assert_eq!(config.error_tolerance, 0.0);
        assert_eq!(config.lambda_initial, 1e-5);
        assert_eq!(config.lambda_factor, 10.0);
        assert_eq!(config.lambda_upper_bound, 1e5);
        assert_eq!(config.lambda_lower_bound, 0.0);
        assert_eq!(config.max_consecutive_rejections, 32);
        assert!(config.use_fixed_lambda_factor);
        assert!(config.diagonal_damping);
        assert_eq!(config.linear_solver_type, LinearSolverType::SparseCholesky);
        assert!(config.timeout.is_none());
        assert!(!config.compute_covariances);
        assert_eq!(
            config.damping_matrix(),
            DampingMatrix::Diagonal {
                min_diagonal: 1e-6,
                max_diagonal: 1e32
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            LevenbergMarquardtConfig::new().with_lambda_factor(1.0),
            LevenbergMarquardtConfig::new().with_lambda_initial(0.0),
            LevenbergMarquardtConfig::new().with_lambda_bounds(0.0, 1e-9),
            LevenbergMarquardtConfig::new().with_relative_error_tolerance(-1.0),
            LevenbergMarquardtConfig::new().with_absolute_error_tolerance(f64::NAN),
            LevenbergMarquardtConfig::new().with_diagonal_bounds(0.0, 1.0),
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(OptimizerError::InvalidParameters(_))
            ));
        }

        // Diagonal bounds are irrelevant with identity damping.
        let identity = LevenbergMarquardtConfig::new()
            .with_diagonal_damping(false)
            .with_diagonal_bounds(0.0, 1.0);
        assert!(identity.validate().is_ok());
        assert_eq!(identity.damping_matrix(), DampingMatrix::Identity);
    }

    #[test]
    fn test_new_rejects_invalid_config() -> TestResult {
        let graph = odometry_graph()?;
        let config = LevenbergMarquardtConfig::new().with_lambda_factor(0.5);
        let result = LevenbergMarquardt::new(&graph, odometry_values()?, config);
        assert!(matches!(
            result,
            Err(SextantError::Optimizer(OptimizerError::InvalidParameters(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_initial_state() -> TestResult {
        let graph = odometry_graph()?;
        let optimizer = LevenbergMarquardt::new(&graph, odometry_values()?, Default::default())?;
        assert_eq!(optimizer.status(), OptimizationStatus::Initialized);
        assert_eq!(optimizer.iterations(), 0);
        assert_eq!(optimizer.lambda(), 1e-5);
        assert!((optimizer.error() - 19.649641746583477).abs() < 1e-9);
        assert_eq!(optimizer.ordering().total_dim(), 9);
        Ok(())
    }

    #[test]
    fn test_iterate_decreases_error_until_converged() -> TestResult {
        let graph = odometry_graph()?;
        let mut optimizer =
            LevenbergMarquardt::new(&graph, odometry_values()?, Default::default())?;

        let mut previous = optimizer.error();
        let mut steps = 0;
        while !optimizer.status().is_terminal() {
            optimizer.iterate()?;
            assert!(optimizer.error() < previous);
            previous = optimizer.error();
            steps += 1;
            assert!(steps <= 10, "did not converge");
        }
        assert_eq!(optimizer.status(), OptimizationStatus::Converged);
        assert_eq!(optimizer.iterations(), 3);

        // Terminal: further iterations change nothing.
        let values = optimizer.values().clone();
        assert_eq!(optimizer.iterate()?, OptimizationStatus::Converged);
        assert_eq!(optimizer.values(), &values);
        assert_eq!(optimizer.iterations(), 3);
        Ok(())
    }

    #[test]
    fn test_nielsen_schedule_converges() -> TestResult {
        let graph = odometry_graph()?;
        let config = LevenbergMarquardtConfig::new()
            .with_fixed_lambda_factor(false)
            .with_diagonal_damping(false);
        let mut optimizer = LevenbergMarquardt::new(&graph, odometry_values()?, config)?;
        let result = optimizer.optimize()?;

        assert_eq!(result.status, OptimizationStatus::Converged);
        assert!(result.final_error < 1e-8);
        let x3 = result.values.get::<SE2>(symbol('x', 3))?;
        assert!((x3.x() - 4.0).abs() < 1e-4);
        assert!(x3.y().abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_linear_problem_with_qr() -> TestResult {
        let mut graph = FactorGraph::new();
        graph.add(PriorFactor::new(
            1,
            Rn::from_slice(&[1.0, -2.0]),
            UnitNoiseModel::new(2)?.into_shared(),
        )?);
        let mut values = Values::new();
        values.insert(1, Rn::zeros(2))?;

        let config = LevenbergMarquardtConfig::new().with_linear_solver_type(LinearSolverType::SparseQR);
        let mut optimizer = LevenbergMarquardt::new(&graph, values, config)?;
        let result = optimizer.optimize()?;

        assert!(result.is_converged());
        let x = result.values.get::<Rn>(1)?;
        assert!((x.component(0) - 1.0).abs() < 1e-6);
        assert!((x.component(1) + 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_damping_limit_exceeded() -> TestResult {
        let (graph, values) = uphill_problem()?;
        let mut optimizer = LevenbergMarquardt::new(&graph, values.clone(), Default::default())?;
        let result = optimizer.optimize()?;

        assert_eq!(
            result.status,
            OptimizationStatus::Failed(FailureReason::DampingLimitExceeded)
        );
        assert!(!result.is_converged());
        assert_eq!(result.iterations, 0);
        assert_eq!(result.values, values);
        assert!((result.final_error - 50.0).abs() < 1e-12);
        assert!(optimizer.lambda() > 1e5);
        Ok(())
    }

    #[test]
    fn test_heavy_damping_is_not_mistaken_for_convergence() -> TestResult {
        // With a high λ ceiling the damped steps become tiny long before the limit is hit.
        let (graph, values) = uphill_problem()?;
        let config = LevenbergMarquardtConfig::new()
            .with_lambda_bounds(0.0, 1e12)
            .with_max_consecutive_rejections(100);
        let mut optimizer = LevenbergMarquardt::new(&graph, values.clone(), config)?;
        let result = optimizer.optimize()?;

        assert_eq!(
            result.status,
            OptimizationStatus::Failed(FailureReason::DampingLimitExceeded)
        );
        assert!(!result.is_converged());
        assert_eq!(optimizer.summary().convergence_reason, None);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.values, values);
        assert!((result.final_error - 50.0).abs() < 1e-12);
        assert!(optimizer.lambda() > 1e12);
        Ok(())
    }

    #[test]
    fn test_singular_system_recovers_with_more_damping() -> TestResult {
        // No prior: the common offset is unobservable and AᵀA + λI is numerically singular
        // until λ grows.
        let noise = UnitNoiseModel::new(1)?.into_shared();
        let mut graph = FactorGraph::new();
        graph.add(BetweenFactor::new(1, 2, Rn::from_slice(&[1.0]), noise.clone())?);
        graph.add(BetweenFactor::new(2, 3, Rn::from_slice(&[1.0]), noise)?);

        let mut values = Values::new();
        values.insert(1, Rn::from_slice(&[0.0]))?;
        values.insert(2, Rn::from_slice(&[0.4]))?;
        values.insert(3, Rn::from_slice(&[2.5]))?;

        let config = LevenbergMarquardtConfig::new()
            .with_diagonal_damping(false)
            .with_lambda_initial(1e-25);
        let mut optimizer = LevenbergMarquardt::new(&graph, values, config)?;
        let result = optimizer.optimize()?;

        assert_eq!(result.status, OptimizationStatus::Converged);
        assert!(result.final_error < 1e-10, "final error {}", result.final_error);
        assert!(optimizer.summary().unsuccessful_steps > 0);
        assert!(optimizer.lambda() > 1e-25);

        let x1 = result.values.get::<Rn>(1)?.component(0);
        let x2 = result.values.get::<Rn>(2)?.component(0);
        let x3 = result.values.get::<Rn>(3)?.component(0);
        assert!((x2 - x1 - 1.0).abs() < 1e-4);
        assert!((x3 - x2 - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_too_many_rejections() -> TestResult {
        let (graph, values) = uphill_problem()?;
        let config = LevenbergMarquardtConfig::new().with_max_consecutive_rejections(3);
        let mut optimizer = LevenbergMarquardt::new(&graph, values, config)?;
        let result = optimizer.optimize()?;

        assert_eq!(
            result.status,
            OptimizationStatus::Failed(FailureReason::TooManyRejections)
        );
        assert_eq!(optimizer.summary().unsuccessful_steps, 4);
        Ok(())
    }

    #[test]
    fn test_zero_timeout() -> TestResult {
        let graph = odometry_graph()?;
        let config = LevenbergMarquardtConfig::new().with_timeout(Duration::ZERO);
        let mut optimizer = LevenbergMarquardt::new(&graph, odometry_values()?, config)?;
        let result = optimizer.optimize()?;

        assert_eq!(result.status, OptimizationStatus::Timeout);
        assert_eq!(result.iterations, 0);
        Ok(())
    }

    #[test]
    fn test_cancelled_before_start() -> TestResult {
        let graph = odometry_graph()?;
        let initial = odometry_values()?;
        let mut optimizer = LevenbergMarquardt::new(&graph, initial.clone(), Default::default())?;
        optimizer.cancellation_token().cancel();

        let result = optimizer.optimize()?;
        assert_eq!(result.status, OptimizationStatus::UserTerminated);
        assert_eq!(result.values, initial);
        Ok(())
    }

    #[test]
    fn test_summary_display() -> TestResult {
        let graph = odometry_graph()?;
        let mut optimizer =
            LevenbergMarquardt::new(&graph, odometry_values()?, Default::default())?;
        optimizer.optimize()?;

        let summary = optimizer.summary();
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.successful_steps, 3);
        assert_eq!(summary.iteration_history.len(), 3);
        assert_eq!(
            summary.convergence_reason,
            Some(ConvergenceReason::AbsoluteDecrease)
        );

        let text = summary.to_string();
        assert!(text.starts_with("Levenberg-Marquardt Final Result"));
        assert!(text.contains("CONVERGED (absolute decrease below tolerance)"));
        Ok(())
    }

    #[test]
    fn test_gain_ratio_guard() {
        assert_eq!(gain_ratio(2.0, 1.0, 2.0), 0.5);
        assert_eq!(gain_ratio(2.0, 1.0, 0.0), 1.0);
        assert_eq!(gain_ratio(1.0, 2.0, 0.0), 0.0);
    }
}
