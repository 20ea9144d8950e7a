use std::sync::Arc;

use clap::Parser;
use sextant::core::loss_functions::{
    CauchyLoss, HuberLoss, LossFunction, TukeyBiweightLoss, WelschLoss,
};
use sextant::{
    BetweenFactor, DiagonalNoiseModel, FactorGraph, LevenbergMarquardt,
    LevenbergMarquardtConfig, LinearSolverType, Marginals, NoiseModel, PriorFactor,
    RobustNoiseModel, SE2, SextantError, Values, format_key, init_logger_with_level, symbol,
};
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "odometry_2d")]
#[command(about = "Optimize a three-pose 2D odometry chain with Levenberg-Marquardt")]
struct Args {
    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// Relative error decrease below which the optimizer stops
    #[arg(long, default_value = "1e-5")]
    relative_tolerance: f64,

    /// Absolute error decrease below which the optimizer stops
    #[arg(long, default_value = "1e-5")]
    absolute_tolerance: f64,

    /// Linear solver: "cholesky" or "qr"
    #[arg(short, long, default_value = "cholesky")]
    solver: String,

    /// Use Nielsen's gain-ratio damping update instead of a fixed factor
    #[arg(long)]
    nielsen: bool,

    /// Robust loss on the odometry factors: "l2", "huber", "cauchy", "welsch", "tukey"
    #[arg(long, default_value = "l2")]
    loss_function: String,

    /// Scale parameter for the loss function
    #[arg(long)]
    loss_scale: Option<f64>,

    /// Print marginal covariances of the solution
    #[arg(long)]
    marginals: bool,

    /// Log level: error, warn, info, debug or trace (RUST_LOG overrides)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn parse_solver(name: &str) -> Result<LinearSolverType, String> {
    match name.to_lowercase().as_str() {
        "cholesky" => Ok(LinearSolverType::SparseCholesky),
        "qr" => Ok(LinearSolverType::SparseQR),
        _ => Err(format!(
            "Unknown linear solver: {name}. Valid options: cholesky, qr"
        )),
    }
}

fn create_loss_function(
    loss_name: &str,
    scale: Option<f64>,
) -> Result<Option<Arc<dyn LossFunction>>, Box<dyn std::error::Error>> {
    let loss: Arc<dyn LossFunction> = match loss_name.to_lowercase().as_str() {
        "l2" => return Ok(None),
        "huber" => Arc::new(HuberLoss::new(scale.unwrap_or(1.345))?),
        "cauchy" => Arc::new(CauchyLoss::new(scale.unwrap_or(2.3849))?),
        "welsch" => Arc::new(WelschLoss::new(scale.unwrap_or(2.9846))?),
        "tukey" => Arc::new(TukeyBiweightLoss::new(scale.unwrap_or(4.6851))?),
        _ => {
            return Err(format!(
                "Unknown loss function: {loss_name}. Valid options: l2, huber, cauchy, welsch, tukey"
            )
            .into());
        }
    };
    Ok(Some(loss))
}

fn build_graph(loss: Option<Arc<dyn LossFunction>>) -> Result<FactorGraph, SextantError> {
    let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
    let mut odometry_noise: Arc<dyn NoiseModel> =
        DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
    if let Some(loss) = loss {
        info!("Using {} loss on odometry factors", loss.name());
        odometry_noise = RobustNoiseModel::new(odometry_noise, loss).into_shared();
    }

    let odometry = SE2::from_xy_angle(2.0, 0.0, 0.0);
    let mut graph = FactorGraph::new();
    graph.add(PriorFactor::new(
        symbol('x', 1),
        SE2::identity(),
        prior_noise,
    )?);
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

/// Deliberately perturbed initial estimate.
fn initial_estimate() -> Result<Values, SextantError> {
    let mut values = Values::new();
    values.insert(symbol('x', 1), SE2::from_xy_angle(0.5, 0.0, 0.2))?;
    values.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, -0.2))?;
    values.insert(symbol('x', 3), SE2::from_xy_angle(4.1, 0.1, 0.1))?;
    Ok(values)
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let solver_type = parse_solver(&args.solver)?;
    let loss = create_loss_function(&args.loss_function, args.loss_scale)?;

    let graph = build_graph(loss)?;
    let initial = initial_estimate()?;
    info!("{graph}");
    info!("Initial estimate:\n{initial}");

    let config = LevenbergMarquardtConfig::new()
        .with_max_iterations(args.max_iterations)
        .with_relative_error_tolerance(args.relative_tolerance)
        .with_absolute_error_tolerance(args.absolute_tolerance)
        .with_fixed_lambda_factor(!args.nielsen)
        .with_linear_solver_type(solver_type);

    let mut optimizer = LevenbergMarquardt::new(&graph, initial, config)?;
    let result = optimizer.optimize()?;

    info!("Final result:\n{}", result.values);
    info!(
        "Status: {}, error {:.6e} -> {:.6e} in {} iterations ({:.2}ms)",
        result.status,
        result.initial_error,
        result.final_error,
        result.iterations,
        result.elapsed_time.as_secs_f64() * 1000.0
    );
    info!("\n{}", optimizer.summary());

    if args.marginals {
        let marginals = Marginals::with_solver_type(&graph, &result.values, solver_type)?;
        for key in graph.keys() {
            let cov = marginals.marginal_covariance(key)?;
            info!("{} covariance:\n{:?}", format_key(key), cov);
        }
    }

    if !result.is_converged() {
        warn!("Optimization did not converge: {}", result.status);
        return Err(format!("optimization ended with status {}", result.status).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger_with_level(args.log_level);

    info!("SEXTANT 2D ODOMETRY OPTIMIZATION\n");

    run(&args).map_err(|e| {
        if let Some(err) = e.downcast_ref::<SextantError>() {
            warn!("Full error chain:\n{}", err.chain());
        }
        e
    })
}
