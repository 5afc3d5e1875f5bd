//! The fitted-model handle.
//!
//! A `FittedModel` is produced once by the fitter and only read afterwards;
//! fields are crate-private and exposed through accessors.

use nalgebra::DMatrix;

use crate::domain::{ConvergenceWarning, Family, MethodKind, ModelSpecification, ResponseScale};
use crate::models::{DesignLayout, GroupIndex};

/// Retained Gibbs draws.
#[derive(Debug, Clone)]
pub struct Posterior {
    /// draws x fixed effects
    pub fixed: Vec<Vec<f64>>,
    /// draws x groups
    pub group: Vec<Vec<f64>>,
    pub residual_variance: Vec<f64>,
    pub random_variance: Vec<f64>,
    /// draws x observations
    pub pointwise_log_lik: Vec<Vec<f64>>,
}

impl Posterior {
    pub fn n_draws(&self) -> usize {
        self.fixed.len()
    }
}

#[derive(Debug, Clone)]
pub struct FittedModel {
    pub(crate) spec: ModelSpecification,
    pub(crate) method: MethodKind,
    pub(crate) scale: ResponseScale,
    pub(crate) layout: DesignLayout,
    pub(crate) groups: GroupIndex,
    pub(crate) coefficients: Vec<f64>,
    pub(crate) covariance: DMatrix<f64>,
    pub(crate) group_effects: Vec<f64>,
    pub(crate) group_effect_variances: Vec<f64>,
    pub(crate) random_variance: f64,
    pub(crate) residual_variance: Option<f64>,
    pub(crate) fitted: Vec<f64>,
    pub(crate) residuals: Vec<f64>,
    pub(crate) log_likelihood: f64,
    pub(crate) n_params: usize,
    pub(crate) fingerprint: u64,
    pub(crate) warnings: Vec<ConvergenceWarning>,
    pub(crate) posterior: Option<Posterior>,
}

impl FittedModel {
    pub fn spec(&self) -> &ModelSpecification {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn family(&self) -> Family {
        self.spec.family
    }

    pub fn method(&self) -> MethodKind {
        self.method
    }

    pub fn scale(&self) -> ResponseScale {
        self.scale
    }

    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    pub fn coefficient_names(&self) -> &[String] {
        self.layout.names()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn coefficient(&self, name: &str) -> Option<f64> {
        let idx = self.layout.names().iter().position(|n| n == name)?;
        self.coefficients.get(idx).copied()
    }

    /// Sampling covariance of the fixed effects.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn std_errors(&self) -> Vec<f64> {
        (0..self.covariance.nrows())
            .map(|j| self.covariance[(j, j)].max(0.0).sqrt())
            .collect()
    }

    /// Conditional modes (ML) or posterior means (Bayesian) per group level.
    pub fn group_effects(&self) -> &[f64] {
        &self.group_effects
    }

    pub fn group_effect_variances(&self) -> &[f64] {
        &self.group_effect_variances
    }

    /// Random-intercept variance `τ²`.
    pub fn random_variance(&self) -> f64 {
        self.random_variance
    }

    /// Residual variance `σ²`; `None` for families without one.
    pub fn residual_variance(&self) -> Option<f64> {
        self.residual_variance
    }

    /// Share of total variance explained by the grouping factor.
    pub fn icc(&self) -> Option<f64> {
        let s2 = self.residual_variance?;
        let total = self.random_variance + s2;
        if total > 0.0 {
            Some(self.random_variance / total)
        } else {
            None
        }
    }

    /// Fitted values on the model's linear-predictor scale.
    pub fn fitted(&self) -> &[f64] {
        &self.fitted
    }

    /// Observed minus fitted (response scale for Poisson).
    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Estimated parameters including variance components.
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn n_obs(&self) -> usize {
        self.fitted.len()
    }

    /// Hash of the response values the model was fitted on.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn posterior(&self) -> Option<&Posterior> {
        self.posterior.as_ref()
    }
}
