//! Observer pattern for optimization monitoring.
//!
//! Observers registered with an optimizer are notified after every accepted iteration. They
//! receive the current [`Values`] and iteration number, preceded by the iteration metrics
//! (error, gradient norm, damping, step norm, gain ratio). Typical uses are progress logging,
//! recording convergence curves in tests and exporting trajectories.
//!
//! ```text
//! ┌─────────────────────┐
//! │  LevenbergMarquardt │
//! └──────────┬──────────┘
//!            │ set_iteration_metrics(..), notify(values, iteration)
//!            ├───────────────┬───────────────┐
//!            ▼               ▼               ▼
//!      ┌──────────┐    ┌──────────┐    ┌──────────┐
//!      │  Logger  │    │ Recorder │    │  Custom  │
//!      └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! # Custom Observer
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use sextant::core::values::Values;
//! use sextant::observers::OptObserver;
//!
//! #[derive(Default, Clone)]
//! struct ErrorRecorder {
//!     errors: Arc<Mutex<Vec<f64>>>,
//! }
//!
//! impl OptObserver for ErrorRecorder {
//!     fn on_step(&self, _values: &Values, _iteration: usize) {}
//!
//!     fn set_iteration_metrics(
//!         &self,
//!         cost: f64,
//!         _gradient_norm: f64,
//!         _damping: Option<f64>,
//!         _step_norm: f64,
//!         _step_quality: Option<f64>,
//!     ) {
//!         if let Ok(mut errors) = self.errors.lock() {
//!             errors.push(cost);
//!         }
//!     }
//! }
//! ```

use tracing::debug;

use crate::core::values::Values;

/// Observer trait for monitoring optimization progress.
///
/// Observers must be `Send` so that optimizers can move between threads. Use interior
/// mutability (`Mutex`, atomics) to record state. Observers should not panic; errors are
/// theirs to handle.
pub trait OptObserver: Send {
    /// Called after each accepted iteration.
    ///
    /// * `values` - variable values after the step
    /// * `iteration` - iteration number, starting at 1
    fn on_step(&self, values: &Values, iteration: usize);

    /// Called before `on_step` with the metrics of the accepted step.
    ///
    /// * `cost` - graph error after the step
    /// * `gradient_norm` - `‖Aᵀr‖` at the linearization point
    /// * `damping` - λ used for the step
    /// * `step_norm` - `‖δ‖`
    /// * `step_quality` - gain ratio ρ, actual over predicted reduction
    fn set_iteration_metrics(
        &self,
        _cost: f64,
        _gradient_norm: f64,
        _damping: Option<f64>,
        _step_norm: f64,
        _step_quality: Option<f64>,
    ) {
    }
}

/// Collection of observers for optimization monitoring.
///
/// Optimizers own one of these and call [`notify`](OptObserverVec::notify) after every
/// accepted step. Notification is a no-op when empty.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Observers are called in registration order.
    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn set_iteration_metrics(
        &self,
        cost: f64,
        gradient_norm: f64,
        damping: Option<f64>,
        step_norm: f64,
        step_quality: Option<f64>,
    ) {
        for observer in &self.observers {
            observer.set_iteration_metrics(cost, gradient_norm, damping, step_norm, step_quality);
        }
    }

    #[inline]
    pub fn notify(&self, values: &Values, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(values, iteration);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Observer that logs one `debug!` line per accepted iteration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl OptObserver for LoggingObserver {
    fn on_step(&self, values: &Values, iteration: usize) {
        debug!("iteration {iteration}: {} variables updated", values.len());
    }

    fn set_iteration_metrics(
        &self,
        cost: f64,
        gradient_norm: f64,
        damping: Option<f64>,
        step_norm: f64,
        step_quality: Option<f64>,
    ) {
        debug!(
            "error {cost:.6e} |g| {gradient_norm:.3e} lambda {:.3e} |dx| {step_norm:.3e} rho {:.3}",
            damping.unwrap_or(0.0),
            step_quality.unwrap_or(0.0)
        );
    }
}
