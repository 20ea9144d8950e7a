//! # Sextant
//!
//! Factor-graph nonlinear least squares for estimating robot poses and other states from
//! noisy relative and absolute measurements.
//!
//! A problem is a [`FactorGraph`] of measurement constraints over keyed variables plus an
//! initial guess in [`Values`]. [`LevenbergMarquardt`] repeatedly linearizes the graph,
//! solves the damped sparse normal equations and retracts the estimate on the variables'
//! manifolds until the error stops decreasing.
//!
//! ## Features
//!
//! - **Lie group variables**: SE(2) poses, SO(2) rotations and Rⁿ vectors with analytic
//!   Jacobians
//! - **Noise models**: diagonal, isotropic, unit, full Gaussian and robust (Huber, Cauchy,
//!   Welsch, Tukey) whitening
//! - **Open factor trait**: prior and between factors built in, custom factors plug in
//! - **Sparse linear algebra**: faer sparse Cholesky (default) or QR with cached symbolic
//!   analysis
//! - **Levenberg-Marquardt**: GTSAM-style convergence rule, fixed or Nielsen damping,
//!   cancellation, timeout and observers
//! - **Marginals**: per-variable covariances at a solution
//!
//! ## Example
//!
//! ```
//! use sextant::{
//!     BetweenFactor, DiagonalNoiseModel, FactorGraph, LevenbergMarquardt,
//!     LevenbergMarquardtConfig, NoiseModel, OptimizationStatus, PriorFactor, SE2, Values,
//!     symbol,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let prior_noise = DiagonalNoiseModel::from_sigmas(&[0.3, 0.3, 0.1])?.into_shared();
//! let odometry_noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?.into_shared();
//! let odometry = SE2::from_xy_angle(2.0, 0.0, 0.0);
//!
//! let mut graph = FactorGraph::new();
//! graph.add(PriorFactor::new(symbol('x', 1), SE2::identity(), prior_noise)?);
//! graph.add(BetweenFactor::new(symbol('x', 1), symbol('x', 2), odometry.clone(), odometry_noise.clone())?);
//! graph.add(BetweenFactor::new(symbol('x', 2), symbol('x', 3), odometry, odometry_noise)?);
//!
//! let mut initial = Values::new();
//! initial.insert(symbol('x', 1), SE2::from_xy_angle(0.5, 0.0, 0.2))?;
//! initial.insert(symbol('x', 2), SE2::from_xy_angle(2.3, 0.1, -0.2))?;
//! initial.insert(symbol('x', 3), SE2::from_xy_angle(4.1, 0.1, 0.1))?;
//!
//! let mut optimizer = LevenbergMarquardt::new(&graph, initial, LevenbergMarquardtConfig::default())?;
//! let result = optimizer.optimize()?;
//!
//! assert_eq!(result.status, OptimizationStatus::Converged);
//! assert!(result.final_error < 1e-8);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod factors;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod observers;
pub mod optimizer;

pub use crate::core::factor_graph::FactorGraph;
pub use crate::core::key::{Key, format_key, symbol};
pub use crate::core::marginals::Marginals;
pub use crate::core::noise_model::{
    DiagonalNoiseModel, GaussianNoiseModel, IsotropicNoiseModel, NoiseModel, RobustNoiseModel,
    UnitNoiseModel,
};
pub use crate::core::values::{Value, Values, VectorValues};
pub use error::{SextantError, SextantResult};

pub use factors::{BetweenFactor, Factor, PriorFactor};

pub use linalg::{LinearSolverType, SparseCholeskySolver, SparseLinearSolver, SparseQRSolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{rn::Rn, se2::SE2, so2::SO2};
pub use optimizer::{
    CancellationToken, LevenbergMarquardt, LevenbergMarquardtConfig, OptObserver,
    OptObserverVec, OptimizationStatus, SolverResult,
};
