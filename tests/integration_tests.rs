//! Integration tests for sextant
//!
//! End-to-end optimization of small pose graphs through the public API.
//!
//! # Test Coverage
//!
//! - **Odometry chain**: prior plus two odometry factors from a perturbed initial guess
//! - **Loop closure**: four-pose square closed back onto the first pose
//! - **Terminal states**: zero-iteration convergence, iteration limit, cancellation
//! - **Marginals**: covariances of the odometry chain at the solution
//! - **Robust losses and other manifolds**: Huber odometry, SO(2) angle wrap-around

use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::{Arc, Mutex};

use sextant::core::CoreError;
use sextant::core::loss_functions::HuberLoss;
use sextant::optimizer::{CancellationToken, ConvergenceReason};
use sextant::{
    BetweenFactor, DiagonalNoiseModel, FactorGraph, IsotropicNoiseModel, LevenbergMarquardt,
    LevenbergMarquardtConfig, LinearSolverType, Marginals, NoiseModel, OptObserver,
    OptimizationStatus, PriorFactor, RobustNoiseModel, SE2, SO2, SextantError, Values, symbol,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const POSE_TOLERANCE: f64 = 1e-6;

fn odometry_graph() -> Result<FactorGraph, SextantError> {
    let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
    let odometry_noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
    let odometry = SE2::from_xy_angle(2.0, 0.0, 0.0);

    let mut graph = FactorGraph::new();
    graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
    graph.add(BetweenFactor::new(
        symbol('x', 1),
        symbol('x', 2),
        odometry.clone(),
        odometry_noise.clone(),
    )?);
    graph.add(BetweenFactor::new(
        symbol('x', 2),
        symbol('x', 3),
        odometry,
        odometry_noise,
    )?);
    Ok(graph)
}

fn odometry_initial() -> Result<Values, SextantError> {
    let mut values = Values::new();
    values.insert(symbol('x', 1), SE2::from_xy_angle(0.5, 0.0, 0.2))?;
    values.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, -0.2))?;
    values.insert(symbol('x', 3), SE2::from_xy_angle(4.1, 0.1, 0.1))?;
    Ok(values)
}

fn assert_pose(values: &Values, index: u64, expected: (f64, f64, f64), tolerance: f64) -> TestResult {
    let pose = values.get::<SE2>(symbol('x', index))?;
    let (x, y, theta) = expected;
    assert!(
        (pose.x() - x).abs() < tolerance
            && (pose.y() - y).abs() < tolerance
            && (pose.angle() - theta).abs() < tolerance,
        "x{index} = ({}, {}, {}), expected ({x}, {y}, {theta})",
        pose.x(),
        pose.y(),
        pose.angle()
    );
    Ok(())
}

/// Records the error reported after every accepted iteration.
#[derive(Default, Clone)]
struct ErrorRecorder {
    errors: Arc<Mutex<Vec<f64>>>,
    iterations: Arc<Mutex<Vec<usize>>>,
}

impl OptObserver for ErrorRecorder {
    fn on_step(&self, _values: &Values, iteration: usize) {
        if let Ok(mut iterations) = self.iterations.lock() {
            iterations.push(iteration);
        }
    }

    fn set_iteration_metrics(
        &self,
        cost: f64,
        _gradient_norm: f64,
        _damping: Option<f64>,
        _step_norm: f64,
        _step_quality: Option<f64>,
    ) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(cost);
        }
    }
}

/// Cancels its token as soon as the first step is reported.
struct CancelAfterFirstStep {
    token: CancellationToken,
}

impl OptObserver for CancelAfterFirstStep {
    fn on_step(&self, _values: &Values, _iteration: usize) {
        self.token.cancel();
    }
}

#[test]
fn test_odometry_chain_converges() -> TestResult {
    let graph = odometry_graph()?;
    let initial = odometry_initial()?;

    let mut optimizer =
        LevenbergMarquardt::new(&graph, initial.clone(), LevenbergMarquardtConfig::default())?;
    let result = optimizer.optimize()?;

    assert_eq!(result.status, OptimizationStatus::Converged);
    assert!((result.initial_error - 19.649641746583477).abs() < 1e-9);
    assert!(result.final_error < 1e-10, "final error {}", result.final_error);
    assert_eq!(result.iterations, 3);

    assert_pose(&result.values, 1, (0.0, 0.0, 0.0), POSE_TOLERANCE)?;
    assert_pose(&result.values, 2, (2.0, 0.0, 0.0), POSE_TOLERANCE)?;
    assert_pose(&result.values, 3, (4.0, 0.0, 0.0), POSE_TOLERANCE)?;

    // The caller's initial values are untouched.
    assert_eq!(initial, odometry_initial()?);

    let info = result.convergence_info.ok_or("missing convergence info")?;
    assert_eq!(info.reason, Some(ConvergenceReason::AbsoluteDecrease));
    assert_eq!(info.jacobian_evaluations, 3);
    assert!(result.covariances.is_none());
    Ok(())
}

#[test]
fn test_errors_decrease_monotonically() -> TestResult {
    let graph = odometry_graph()?;
    let recorder = ErrorRecorder::default();

    let mut optimizer = LevenbergMarquardt::new(
        &graph,
        odometry_initial()?,
        LevenbergMarquardtConfig::default(),
    )?;
    optimizer.add_observer(recorder.clone());
    let result = optimizer.optimize()?;

    let errors = recorder.errors.lock().map_err(|e| e.to_string())?.clone();
    let iterations = recorder.iterations.lock().map_err(|e| e.to_string())?.clone();
    assert_eq!(errors.len(), result.iterations);
    assert_eq!(iterations, (1..=result.iterations).collect::<Vec<_>>());

    let mut previous = result.initial_error;
    for error in &errors {
        assert!(*error < previous, "error increased: {previous} -> {error}");
        previous = *error;
    }
    assert_eq!(errors.last().copied(), Some(result.final_error));

    // First step is nearly Gauss-Newton and removes almost all the error.
    assert!((errors[0] - 0.1107).abs() < 1e-3, "first error {}", errors[0]);
    Ok(())
}

#[test]
fn test_optimize_is_idempotent() -> TestResult {
    let graph = odometry_graph()?;
    let mut optimizer = LevenbergMarquardt::new(
        &graph,
        odometry_initial()?,
        LevenbergMarquardtConfig::default(),
    )?;

    let first = optimizer.optimize()?;
    let second = optimizer.optimize()?;

    assert_eq!(first.status, second.status);
    assert_eq!(first.iterations, second.iterations);
    assert_eq!(first.final_error, second.final_error);
    assert_eq!(first.values, second.values);
    assert_eq!(optimizer.iterations(), first.iterations);
    Ok(())
}

#[test]
fn test_perfect_initial_guess_converges_without_iterating() -> TestResult {
    let graph = odometry_graph()?;
    let mut initial = Values::new();
    initial.insert(symbol('x', 1), SE2::identity())?;
    initial.insert(symbol('x', 2), SE2::from_xy_angle(2.0, 0.0, 0.0))?;
    initial.insert(symbol('x', 3), SE2::from_xy_angle(4.0, 0.0, 0.0))?;

    assert_eq!(graph.error(&initial)?, 0.0);

    let mut optimizer =
        LevenbergMarquardt::new(&graph, initial.clone(), LevenbergMarquardtConfig::default())?;
    let result = optimizer.optimize()?;

    assert_eq!(result.status, OptimizationStatus::Converged);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.final_error, 0.0);
    assert_eq!(result.values, initial);
    Ok(())
}

#[test]
fn test_iteration_limit_is_not_convergence() -> TestResult {
    let graph = odometry_graph()?;
    let config = LevenbergMarquardtConfig::new().with_max_iterations(1);
    let mut optimizer = LevenbergMarquardt::new(&graph, odometry_initial()?, config)?;
    let result = optimizer.optimize()?;

    assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
    assert!(!result.is_converged());
    assert_eq!(result.iterations, 1);
    assert!(result.final_error < result.initial_error);
    assert_eq!(optimizer.values(), &result.values);
    Ok(())
}

#[test]
fn test_zero_iteration_budget() -> TestResult {
    let graph = odometry_graph()?;
    let initial = odometry_initial()?;
    let config = LevenbergMarquardtConfig::new().with_max_iterations(0);
    let mut optimizer = LevenbergMarquardt::new(&graph, initial.clone(), config)?;
    let result = optimizer.optimize()?;

    assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.values, initial);
    Ok(())
}

#[test]
fn test_missing_value_is_rejected() -> TestResult {
    let graph = odometry_graph()?;
    let mut initial = odometry_initial()?;
    initial.erase(symbol('x', 3))?;

    let result = LevenbergMarquardt::new(&graph, initial, LevenbergMarquardtConfig::default());
    match result {
        Err(SextantError::Core(CoreError::KeyNotFound { key })) => {
            assert_eq!(key, symbol('x', 3));
        }
        Err(e) => return Err(format!("unexpected error: {e}").into()),
        Ok(_) => return Err("expected KeyNotFound".into()),
    }
    Ok(())
}

#[test]
fn test_odometry_marginals() -> TestResult {
    let graph = odometry_graph()?;
    let config = LevenbergMarquardtConfig::new().with_compute_covariances(true);
    let mut optimizer = LevenbergMarquardt::new(&graph, odometry_initial()?, config)?;
    let result = optimizer.optimize()?;

    let expected = [
        [[0.09, 0.0, 0.0], [0.0, 0.09, 0.0], [0.0, 0.0, 0.01]],
        [[0.13, 0.0, 0.0], [0.0, 0.17, 0.02], [0.0, 0.02, 0.02]],
        [[0.17, 0.0, 0.0], [0.0, 0.37, 0.06], [0.0, 0.06, 0.03]],
    ];

    let covariances = result.covariances.ok_or("missing covariances")?;
    assert_eq!(covariances.len(), 3);

    for solver in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
        let marginals = Marginals::with_solver_type(&graph, &result.values, solver)?;
        for (index, block) in expected.iter().enumerate() {
            let key = symbol('x', index as u64 + 1);
            let marginal = marginals.marginal_covariance(key)?;
            let attached = covariances.get(&key).ok_or("missing key")?;
            for i in 0..3 {
                for j in 0..3 {
                    assert!(
                        (marginal[(i, j)] - block[i][j]).abs() < 1e-6,
                        "{solver} x{} ({i}, {j}) = {}",
                        index + 1,
                        marginal[(i, j)]
                    );
                    assert!((attached[(i, j)] - marginal[(i, j)]).abs() < 1e-9);
                }
            }
        }
    }

    // Joint marginal of x1 and x3: x3 inherits x1's heading uncertainty.
    let marginals = Marginals::new(&graph, &result.values)?;
    let joint = marginals.joint_marginal_covariance(&[symbol('x', 1), symbol('x', 3)])?;
    assert_eq!((joint.nrows(), joint.ncols()), (6, 6));
    assert!((joint[(0, 0)] - 0.09).abs() < 1e-6);
    assert!((joint[(5, 5)] - 0.03).abs() < 1e-6);
    assert!((joint[(2, 4)] - 0.04).abs() < 1e-6);
    assert!((joint[(4, 2)] - joint[(2, 4)]).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_cancellation_stops_at_iteration_boundary() -> TestResult {
    let graph = odometry_graph()?;
    let mut optimizer = LevenbergMarquardt::new(
        &graph,
        odometry_initial()?,
        LevenbergMarquardtConfig::default(),
    )?;
    let token = optimizer.cancellation_token();
    optimizer.add_observer(CancelAfterFirstStep { token });

    let result = optimizer.optimize()?;
    assert_eq!(result.status, OptimizationStatus::UserTerminated);
    assert_eq!(result.iterations, 1);
    assert!(result.final_error < result.initial_error);
    Ok(())
}

#[test]
fn test_square_loop_closure() -> TestResult {
    let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
    let odometry_noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
    let turn = SE2::from_xy_angle(2.0, 0.0, FRAC_PI_2);

    let mut graph = FactorGraph::new();
    graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
    for (from, to) in [(1, 2), (2, 3), (3, 4), (4, 1)] {
        graph.add(BetweenFactor::new(
            symbol('x', from),
            symbol('x', to),
            turn.clone(),
            odometry_noise.clone(),
        )?);
    }

    let mut initial = Values::new();
    initial.insert(symbol('x', 1), SE2::from_xy_angle(0.2, -0.2, 0.1))?;
    initial.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, FRAC_PI_2 - 0.1))?;
    initial.insert(symbol('x', 3), SE2::from_xy_angle(2.1, 2.2, PI - 0.05))?;
    initial.insert(symbol('x', 4), SE2::from_xy_angle(-0.1, 2.1, -FRAC_PI_2 + 0.1))?;

    let config = LevenbergMarquardtConfig::new().with_absolute_error_tolerance(1e-12);
    let mut optimizer = LevenbergMarquardt::new(&graph, initial, config)?;
    let result = optimizer.optimize()?;

    assert!(result.is_converged(), "status {}", result.status);
    assert!(result.final_error < 1e-10);
    assert_pose(&result.values, 1, (0.0, 0.0, 0.0), 1e-5)?;
    assert_pose(&result.values, 2, (2.0, 0.0, FRAC_PI_2), 1e-5)?;
    assert_pose(&result.values, 4, (0.0, 2.0, -FRAC_PI_2), 1e-5)?;

    // x3 sits at heading ±π; compare positions and the wrapped angle separately.
    let x3 = result.values.get::<SE2>(symbol('x', 3))?;
    assert!((x3.x() - 2.0).abs() < 1e-5 && (x3.y() - 2.0).abs() < 1e-5);
    assert!((x3.angle().abs() - PI).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_robust_odometry_converges_to_truth() -> TestResult {
    let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
    let odometry_noise = RobustNoiseModel::new(
        DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared(),
        Arc::new(HuberLoss::new(1.345)?),
    )
    .into_shared();
    let odometry = SE2::from_xy_angle(2.0, 0.0, 0.0);

    let mut graph = FactorGraph::new();
    graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
    graph.add(BetweenFactor::new(
        symbol('x', 1),
        symbol('x', 2),
        odometry.clone(),
        odometry_noise.clone(),
    )?);
    graph.add(BetweenFactor::new(
        symbol('x', 2),
        symbol('x', 3),
        odometry,
        odometry_noise,
    )?);

    let mut optimizer = LevenbergMarquardt::new(
        &graph,
        odometry_initial()?,
        LevenbergMarquardtConfig::default(),
    )?;
    let result = optimizer.optimize()?;

    assert!(result.is_converged(), "status {}", result.status);
    assert!(result.final_error < result.initial_error);
    assert_pose(&result.values, 3, (4.0, 0.0, 0.0), 1e-3)?;
    Ok(())
}

#[test]
fn test_rotation_chain_wraps_angles() -> TestResult {
    let noise = IsotropicNoiseModel::from_sigma(1, 0.1)?.into_shared();

    let mut graph = FactorGraph::new();
    graph.add(PriorFactor::new(1, SO2::from_angle(3.0), noise.clone())?);
    graph.add(BetweenFactor::new(1, 2, SO2::from_angle(0.3), noise)?);

    // 3.3 rad is -2.983 after wrapping.
    let mut initial = Values::new();
    initial.insert(1, SO2::from_angle(2.9))?;
    initial.insert(2, SO2::from_angle(-3.0))?;

    let mut optimizer =
        LevenbergMarquardt::new(&graph, initial, LevenbergMarquardtConfig::default())?;
    let result = optimizer.optimize()?;

    assert!(result.is_converged());
    let x1 = result.values.get::<SO2>(1)?;
    let x2 = result.values.get::<SO2>(2)?;
    assert!((x1.angle() - 3.0).abs() < 1e-6);
    assert!((x2.angle() - (3.3 - 2.0 * PI)).abs() < 1e-6);
    Ok(())
}
