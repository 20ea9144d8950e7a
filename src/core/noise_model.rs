//! Measurement noise models.
//!
//! A noise model turns a raw residual `r` with covariance `Σ` into a whitened residual
//! `R·r` whose squared norm is the Mahalanobis distance `rᵀ Σ⁻¹ r`. Factors whiten both the
//! residual and its Jacobian blocks, so the optimizer only ever sees unit-covariance terms.
//!
//! - [`DiagonalNoiseModel`]: one sigma per residual dimension
//! - [`IsotropicNoiseModel`]: a single sigma for every dimension
//! - [`UnitNoiseModel`]: identity whitening
//! - [`GaussianNoiseModel`]: full covariance
//! - [`RobustNoiseModel`]: any of the above combined with an M-estimator
//!
//! # Example
//!
//! ```
//! use sextant::core::noise_model::{DiagonalNoiseModel, NoiseModel};
//! use nalgebra::DVector;
//! # use sextant::error::SextantResult;
//! # fn example() -> SextantResult<()> {
//! let noise = DiagonalNoiseModel::from_sigmas(&[0.2, 0.2, 0.1])?;
//! let whitened = noise.whiten(&DVector::from_vec(vec![0.2, 0.4, 0.1]))?;
//! assert_eq!(whitened, DVector::from_vec(vec![1.0, 2.0, 1.0]));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult, corrector::Corrector, loss_functions::LossFunction};

/// Whitening transform bound to a factor at construction.
pub trait NoiseModel: Send + Sync + Debug {
    /// Residual dimension this model applies to.
    fn dim(&self) -> usize;

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>>;

    /// Applies the whitening to every row of a Jacobian block.
    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>>;

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>>;

    /// `rᵀ Σ⁻¹ r`.
    fn squared_mahalanobis_distance(&self, residual: &DVector<f64>) -> CoreResult<f64> {
        Ok(self.whiten(residual)?.norm_squared())
    }

    /// Error contribution of a residual at the given squared distance.
    fn loss(&self, squared_distance: f64) -> f64 {
        0.5 * squared_distance
    }

    /// Reweights a whitened residual and its Jacobian blocks. No-op for Gaussian models.
    fn robustify(
        &self,
        _whitened_residual: &mut DVector<f64>,
        _whitened_jacobians: &mut [DMatrix<f64>],
    ) {
    }

    fn describe(&self) -> String;

    fn into_shared(self) -> Arc<dyn NoiseModel>
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }
}

fn invalid_noise_model(message: impl Into<String>) -> CoreError {
    CoreError::InvalidNoiseModel(message.into()).log()
}

fn check_len(context: &str, expected: usize, actual: usize) -> CoreResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::dimension_mismatch(context, expected, actual).log())
    }
}

fn scale_rows(jacobian: &DMatrix<f64>, factors: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = jacobian.clone();
    for (i, mut row) in scaled.row_iter_mut().enumerate() {
        row *= factors[i];
    }
    scaled
}

/// Independent Gaussian noise with per-dimension standard deviations.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalNoiseModel {
    sigmas: DVector<f64>,
    inv_sigmas: DVector<f64>,
}

impl DiagonalNoiseModel {
    /// Fails with `InvalidNoiseModel` for an empty list or any sigma that is not a positive,
    /// finite number.
    pub fn from_sigmas(sigmas: &[f64]) -> CoreResult<Self> {
        if sigmas.is_empty() {
            return Err(invalid_noise_model("at least one sigma is required"));
        }
        if let Some(bad) = sigmas.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(invalid_noise_model(format!(
                "sigmas must be positive and finite, got {bad}"
            )));
        }
        let sigmas = DVector::from_row_slice(sigmas);
        let inv_sigmas = sigmas.map(|s| 1.0 / s);
        Ok(DiagonalNoiseModel { sigmas, inv_sigmas })
    }

    pub fn from_variances(variances: &[f64]) -> CoreResult<Self> {
        let sigmas: Vec<f64> = variances.iter().map(|v| v.sqrt()).collect();
        Self::from_sigmas(&sigmas)
    }

    pub fn from_precisions(precisions: &[f64]) -> CoreResult<Self> {
        let sigmas: Vec<f64> = precisions.iter().map(|p| 1.0 / p.sqrt()).collect();
        Self::from_sigmas(&sigmas)
    }

    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }
}

impl NoiseModel for DiagonalNoiseModel {
    fn dim(&self) -> usize {
        self.sigmas.len()
    }

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("whiten", self.dim(), residual.len())?;
        Ok(residual.component_mul(&self.inv_sigmas))
    }

    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>> {
        check_len("whiten_jacobian", self.dim(), jacobian.nrows())?;
        Ok(scale_rows(jacobian, &self.inv_sigmas))
    }

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("unwhiten", self.dim(), whitened.len())?;
        Ok(whitened.component_mul(&self.sigmas))
    }

    fn describe(&self) -> String {
        let sigmas: Vec<String> = self.sigmas.iter().map(|s| format!("{s}")).collect();
        format!("Diagonal sigmas [{}]", sigmas.join(", "))
    }
}

/// The same standard deviation for every residual dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotropicNoiseModel {
    dim: usize,
    sigma: f64,
}

impl IsotropicNoiseModel {
    pub fn from_sigma(dim: usize, sigma: f64) -> CoreResult<Self> {
        if dim == 0 {
            return Err(invalid_noise_model("dimension must be positive"));
        }
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(invalid_noise_model(format!(
                "sigma must be positive and finite, got {sigma}"
            )));
        }
        Ok(IsotropicNoiseModel { dim, sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl NoiseModel for IsotropicNoiseModel {
    fn dim(&self) -> usize {
        self.dim
    }

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("whiten", self.dim, residual.len())?;
        Ok(residual / self.sigma)
    }

    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>> {
        check_len("whiten_jacobian", self.dim, jacobian.nrows())?;
        Ok(jacobian / self.sigma)
    }

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("unwhiten", self.dim, whitened.len())?;
        Ok(whitened * self.sigma)
    }

    fn describe(&self) -> String {
        format!("Isotropic dim {} sigma {}", self.dim, self.sigma)
    }
}

/// Unit covariance: residuals are already whitened.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitNoiseModel {
    dim: usize,
}

impl UnitNoiseModel {
    pub fn new(dim: usize) -> CoreResult<Self> {
        if dim == 0 {
            return Err(invalid_noise_model("dimension must be positive"));
        }
        Ok(UnitNoiseModel { dim })
    }
}

impl NoiseModel for UnitNoiseModel {
    fn dim(&self) -> usize {
        self.dim
    }

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("whiten", self.dim, residual.len())?;
        Ok(residual.clone())
    }

    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>> {
        check_len("whiten_jacobian", self.dim, jacobian.nrows())?;
        Ok(jacobian.clone())
    }

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("unwhiten", self.dim, whitened.len())?;
        Ok(whitened.clone())
    }

    fn describe(&self) -> String {
        format!("Unit dim {}", self.dim)
    }
}

/// Correlated Gaussian noise given by a full covariance matrix.
///
/// Whitening multiplies by the upper-triangular square-root information `R`, the Cholesky
/// factor of `Σ⁻¹ = RᵀR`, so that `‖R r‖² = rᵀ Σ⁻¹ r`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianNoiseModel {
    sqrt_information: DMatrix<f64>,
    covariance: DMatrix<f64>,
}

impl GaussianNoiseModel {
    /// Fails with `InvalidNoiseModel` unless `covariance` is square, symmetric and positive
    /// definite.
    pub fn from_covariance(covariance: &DMatrix<f64>) -> CoreResult<Self> {
        let n = covariance.nrows();
        if n == 0 || covariance.ncols() != n {
            return Err(invalid_noise_model(format!(
                "covariance must be square and non-empty, got {}x{}",
                n,
                covariance.ncols()
            )));
        }

        let scale = covariance.amax().max(1.0);
        if (covariance - covariance.transpose()).amax() > 1e-9 * scale {
            return Err(invalid_noise_model("covariance is not symmetric"));
        }

        let information = covariance
            .clone()
            .cholesky()
            .ok_or_else(|| invalid_noise_model("covariance is not positive definite"))?
            .inverse();
        let information = (&information + information.transpose()) * 0.5;
        let sqrt_information = information
            .cholesky()
            .ok_or_else(|| invalid_noise_model("information matrix is not positive definite"))?
            .l()
            .transpose();

        Ok(GaussianNoiseModel {
            sqrt_information,
            covariance: covariance.clone(),
        })
    }

    /// Upper-triangular `R` with `RᵀR = Σ⁻¹`.
    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}

impl NoiseModel for GaussianNoiseModel {
    fn dim(&self) -> usize {
        self.sqrt_information.nrows()
    }

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("whiten", self.dim(), residual.len())?;
        Ok(&self.sqrt_information * residual)
    }

    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>> {
        check_len("whiten_jacobian", self.dim(), jacobian.nrows())?;
        Ok(&self.sqrt_information * jacobian)
    }

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>> {
        check_len("unwhiten", self.dim(), whitened.len())?;
        self.sqrt_information
            .solve_upper_triangular(whitened)
            .ok_or_else(|| invalid_noise_model("square-root information is singular"))
    }

    fn describe(&self) -> String {
        format!("Gaussian dim {}", self.dim())
    }
}

/// A base noise model combined with a robust loss.
///
/// The error contribution becomes `0.5·ρ(s)` and linearization reweights the whitened
/// residual and Jacobians through the [`Corrector`].
#[derive(Debug, Clone)]
pub struct RobustNoiseModel {
    base: Arc<dyn NoiseModel>,
    loss: Arc<dyn LossFunction>,
}

impl RobustNoiseModel {
    pub fn new(base: Arc<dyn NoiseModel>, loss: Arc<dyn LossFunction>) -> Self {
        RobustNoiseModel { base, loss }
    }

    pub fn base(&self) -> &Arc<dyn NoiseModel> {
        &self.base
    }

    pub fn loss_function(&self) -> &Arc<dyn LossFunction> {
        &self.loss
    }
}

impl NoiseModel for RobustNoiseModel {
    fn dim(&self) -> usize {
        self.base.dim()
    }

    fn whiten(&self, residual: &DVector<f64>) -> CoreResult<DVector<f64>> {
        self.base.whiten(residual)
    }

    fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> CoreResult<DMatrix<f64>> {
        self.base.whiten_jacobian(jacobian)
    }

    fn unwhiten(&self, whitened: &DVector<f64>) -> CoreResult<DVector<f64>> {
        self.base.unwhiten(whitened)
    }

    fn loss(&self, squared_distance: f64) -> f64 {
        0.5 * self.loss.evaluate(squared_distance)[0]
    }

    fn robustify(
        &self,
        whitened_residual: &mut DVector<f64>,
        whitened_jacobians: &mut [DMatrix<f64>],
    ) {
        let corrector = Corrector::new(self.loss.as_ref(), whitened_residual.norm_squared());
        for jacobian in whitened_jacobians.iter_mut() {
            corrector.correct_jacobian(whitened_residual, jacobian);
        }
        corrector.correct_residuals(whitened_residual);
    }

    fn describe(&self) -> String {
        format!("Robust {} over {}", self.loss.name(), self.base.describe())
    }
}
