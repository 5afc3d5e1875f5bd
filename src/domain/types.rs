//! Shared domain types.
//!
//! Specifications, method configuration and report types are kept plain and
//! serializable so they can be read from workflow files and exported as JSON.

use std::collections::HashSet;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::data::{Column, ObservationTable};
use crate::error::AppError;

/// Response distribution of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Normal errors on the (possibly log-transformed) response.
    #[default]
    Gaussian,
    /// Counts with a log link; no residual variance term.
    Poisson,
}

/// A single fixed-effect term.
///
/// Serialized externally tagged so workflow files read naturally:
/// `{"linear": "X"}` and `{"quadratic": {"base": "X", "column": "X2"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixedTerm {
    /// A covariate entering linearly (numeric) or as treatment dummies (categorical).
    Linear(String),
    /// The second-order term paired with `base`.
    ///
    /// `column` names a precomputed squared column in the table; when absent
    /// the square of `base` is computed.
    Quadratic {
        base: String,
        #[serde(default)]
        column: Option<String>,
    },
}

impl FixedTerm {
    pub fn display_name(&self) -> String {
        match self {
            FixedTerm::Linear(c) => c.clone(),
            FixedTerm::Quadratic { column: Some(c), .. } => c.clone(),
            FixedTerm::Quadratic { base, column: None } => format!("{base}^2"),
        }
    }
}

/// A structured random-intercept model description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpecification {
    pub label: String,
    pub response: String,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub terms: Vec<FixedTerm>,
    pub group: String,
}

impl ModelSpecification {
    /// Intercept plus grouping random effect only.
    pub fn null(label: impl Into<String>, response: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            response: response.into(),
            family: Family::Gaussian,
            terms: Vec::new(),
            group: group.into(),
        }
    }

    pub fn with_family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn linear(mut self, column: impl Into<String>) -> Self {
        self.terms.push(FixedTerm::Linear(column.into()));
        self
    }

    pub fn quadratic(mut self, base: impl Into<String>, column: Option<&str>) -> Self {
        self.terms.push(FixedTerm::Quadratic {
            base: base.into(),
            column: column.map(str::to_string),
        });
        self
    }

    pub fn is_null(&self) -> bool {
        self.terms.is_empty()
    }

    /// Human-readable formula, e.g. `log_y ~ X + X2 + (1 | year)`.
    pub fn formula(&self) -> String {
        let mut rhs: Vec<String> = vec!["1".to_string()];
        rhs.extend(self.terms.iter().map(FixedTerm::display_name));
        format!("{} ~ {} + (1 | {})", self.response, rhs.join(" + "), self.group)
    }

    /// Structural checks that need no table: term pairing and duplicates.
    ///
    /// Duplicates are judged by the design column a term produces, so a
    /// computed square and a precomputed square of the same base collide.
    pub fn validate_structure(&self) -> Result<(), AppError> {
        let mut effects: HashSet<(&str, u8)> = HashSet::new();
        let mut columns: HashSet<&str> = HashSet::new();
        for term in &self.terms {
            let (effect, column) = match term {
                FixedTerm::Linear(c) => ((c.as_str(), 1), Some(c.as_str())),
                FixedTerm::Quadratic { base, column } => ((base.as_str(), 2), column.as_deref()),
            };
            let duplicate = !effects.insert(effect) || column.is_some_and(|c| !columns.insert(c));
            if duplicate {
                return Err(AppError::spec(
                    &self.label,
                    format!("term `{}` duplicates an earlier term", term.display_name()),
                ));
            }
        }

        for term in &self.terms {
            if let FixedTerm::Quadratic { base, .. } = term {
                let has_linear = self
                    .terms
                    .iter()
                    .any(|t| matches!(t, FixedTerm::Linear(c) if c == base));
                if !has_linear {
                    return Err(AppError::spec(
                        &self.label,
                        format!("second-order term for `{base}` requires the first-order term `{base}`"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Full validation against the table the model will be fitted on.
    pub fn validate(&self, table: &ObservationTable) -> Result<(), AppError> {
        self.validate_structure()?;

        match table.column(&self.response) {
            Some(Column::Numeric(_)) => {}
            Some(Column::Categorical(_)) => {
                return Err(AppError::spec(
                    &self.label,
                    format!("response `{}` is not numeric", self.response),
                ));
            }
            None => {
                return Err(AppError::spec(
                    &self.label,
                    format!("response column `{}` is absent", self.response),
                ));
            }
        }

        if !table.has_column(&self.group) {
            return Err(AppError::spec(
                &self.label,
                format!("grouping column `{}` is absent", self.group),
            ));
        }
        if self.group != table.group() {
            return Err(AppError::spec(
                &self.label,
                format!(
                    "grouping column `{}` is not the table's grouping column `{}`",
                    self.group,
                    table.group()
                ),
            ));
        }

        if self.family == Family::Poisson && table.derivation(&self.response).is_some() {
            return Err(AppError::spec(
                &self.label,
                "the poisson family models raw counts; use the untransformed response",
            ));
        }

        for term in &self.terms {
            match term {
                FixedTerm::Linear(c) => self.check_covariate(table, c, false)?,
                FixedTerm::Quadratic { base, column } => {
                    self.check_covariate(table, base, true)?;
                    if let Some(c) = column {
                        self.check_covariate(table, c, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_covariate(&self, table: &ObservationTable, name: &str, numeric_only: bool) -> Result<(), AppError> {
        if name == self.response || name == self.group {
            return Err(AppError::spec(
                &self.label,
                format!("`{name}` cannot be both a covariate and the response/grouping column"),
            ));
        }
        match table.column(name) {
            None => Err(AppError::spec(&self.label, format!("covariate `{name}` is absent"))),
            Some(Column::Categorical(_)) if numeric_only => Err(AppError::spec(
                &self.label,
                format!("second-order term requires numeric `{name}`"),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Every table column this specification reads.
    pub fn columns_used(&self) -> Vec<&str> {
        let mut out = vec![self.response.as_str(), self.group.as_str()];
        for term in &self.terms {
            match term {
                FixedTerm::Linear(c) => out.push(c),
                FixedTerm::Quadratic { base, column } => {
                    out.push(base);
                    if let Some(c) = column {
                        out.push(c);
                    }
                }
            }
        }
        let mut seen = HashSet::new();
        out.retain(|c| seen.insert(*c));
        out
    }
}

/// Scale on which the model's linear predictor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseScale {
    Natural,
    Log,
}

/// Settings for the profiled maximum-likelihood fitters.
///
/// The variance search runs over the ratio `τ²/σ²` for Gaussian models and over
/// `τ²` directly for Poisson models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlConfig {
    pub ratio_min: f64,
    pub ratio_max: f64,
    pub grid_steps: usize,
    /// Golden-section stopping width (relative).
    pub tol: f64,
    pub max_iter: usize,
    /// Penalised Newton iterations per variance value (Poisson only).
    pub inner_max_iter: usize,
    /// Estimated variance ratios below this are reported as singular.
    pub singular_tol: f64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            ratio_min: 1e-6,
            ratio_max: 1e4,
            grid_steps: 41,
            tol: 1e-8,
            max_iter: 200,
            inner_max_iter: 50,
            singular_tol: 1e-4,
        }
    }
}

/// Settings for the Gibbs sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesConfig {
    pub warmup: usize,
    pub draws: usize,
    pub thin: usize,
    pub seed: u64,
    /// Prior standard deviation of each fixed effect (centred at zero).
    pub prior_beta_sd: f64,
    /// Inverse-gamma shape for both variance components.
    pub prior_shape: f64,
    /// Inverse-gamma rate for both variance components.
    pub prior_rate: f64,
    /// Posterior mean variance ratios below this are reported as singular.
    pub singular_tol: f64,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            warmup: 1000,
            draws: 1000,
            thin: 1,
            seed: 42,
            prior_beta_sd: 100.0,
            prior_shape: 1.0,
            prior_rate: 0.01,
            singular_tol: 1e-4,
        }
    }
}

impl BayesConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.draws < 100 {
            return Err(AppError::InvalidConfig(format!(
                "at least 100 retained draws are required (got {})",
                self.draws
            )));
        }
        if self.thin == 0 {
            return Err(AppError::InvalidConfig("thin must be >= 1".to_string()));
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !(positive(self.prior_beta_sd) && positive(self.prior_shape) && positive(self.prior_rate)) {
            return Err(AppError::InvalidConfig(
                "prior parameters must be finite and > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a model is fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    MaximumLikelihood(MlConfig),
    Bayesian(BayesConfig),
}

impl FitMethod {
    pub fn kind(&self) -> MethodKind {
        match self {
            FitMethod::MaximumLikelihood(_) => MethodKind::MaximumLikelihood,
            FitMethod::Bayesian(_) => MethodKind::Bayesian,
        }
    }
}

/// CLI-facing method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    #[value(name = "ml")]
    MaximumLikelihood,
    #[value(name = "bayes")]
    Bayesian,
}

/// Non-fatal fitting diagnostics attached to a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceWarning {
    /// Random-intercept variance estimated at or near zero.
    SingularFit { ratio: f64 },
    /// An optimiser stopped at its iteration cap.
    IterationLimit { stage: String, iterations: usize },
    /// Variance estimate pinned to the upper end of the search range.
    BoundaryEstimate { ratio: f64 },
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceWarning::SingularFit { ratio } => {
                write!(f, "singular fit: random-intercept variance ratio {ratio:.3e}")
            }
            ConvergenceWarning::IterationLimit { stage, iterations } => {
                write!(f, "{stage} stopped after {iterations} iterations without converging")
            }
            ConvergenceWarning::BoundaryEstimate { ratio } => {
                write!(f, "variance estimate {ratio:.3e} sits on the search boundary")
            }
        }
    }
}

/// Information-criterion variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IcKind {
    Aic,
    /// Small-sample corrected AIC.
    Aicc,
    Bic,
}

/// Fit-quality score used to rank models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    InformationCriterion(IcKind),
    LeaveOneOut,
}

impl Criterion {
    pub fn display_name(self) -> &'static str {
        match self {
            Criterion::InformationCriterion(IcKind::Aic) => "AIC",
            Criterion::InformationCriterion(IcKind::Aicc) => "AICc",
            Criterion::InformationCriterion(IcKind::Bic) => "BIC",
            Criterion::LeaveOneOut => "elpd_loo",
        }
    }

    pub fn higher_is_better(self) -> bool {
        matches!(self, Criterion::LeaveOneOut)
    }
}

/// Selector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub criterion: Criterion,
    /// Score differences below this are treated as indistinguishable.
    pub negligible_delta: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            criterion: Criterion::InformationCriterion(IcKind::Aic),
            negligible_delta: 2.0,
        }
    }
}

/// One ranked model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRow {
    pub label: String,
    pub formula: String,
    pub score: f64,
    /// 1-based.
    pub rank: usize,
    /// Distance from the best score (always >= 0).
    pub delta_from_best: f64,
    /// Signed difference to the null model; negative means better than null.
    pub delta_from_null: Option<f64>,
    pub indistinguishable_from_best: bool,
    pub n_params: usize,
    pub log_likelihood: f64,
    pub convergence_warning: bool,
    /// Leave-one-out only: standard error of the elpd difference to the best.
    pub se_delta: Option<f64>,
    /// Leave-one-out only: observations with Pareto k above 0.7.
    pub high_pareto_k: Option<usize>,
}

/// Ranked comparison of fitted models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub criterion: Criterion,
    pub negligible_delta: f64,
    pub n_obs: usize,
    /// Sorted best first.
    pub rows: Vec<SelectionRow>,
    pub best: String,
    /// Other models within `negligible_delta` of the best.
    pub tied_with_best: Vec<String>,
    pub sole_winner: bool,
    pub null_label: Option<String>,
}

impl SelectionReport {
    pub fn row(&self, label: &str) -> Option<&SelectionRow> {
        self.rows.iter().find(|r| r.label == label)
    }
}

/// Predictor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOptions {
    /// Interval coverage in (0, 1).
    pub level: f64,
    /// Simulate intervals; when false only point predictions are produced.
    pub intervals: bool,
    pub include_residual_variance: bool,
    pub simulations: usize,
    pub seed: u64,
    /// Add group-level intercepts to predictions (population-level when false).
    pub include_group_effects: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            level: 0.95,
            intervals: true,
            include_residual_variance: true,
            simulations: 1000,
            seed: 42,
            include_group_effects: true,
        }
    }
}

/// Per-row prediction on the fit scale and the natural scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub fit: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub fit_natural: f64,
    pub lower_natural: Option<f64>,
    pub upper_natural: Option<f64>,
}

/// Source rows joined with predictions.
#[derive(Debug, Clone)]
pub struct PredictionFrame {
    pub model: String,
    pub scale: ResponseScale,
    pub level: Option<f64>,
    pub table: ObservationTable,
    pub rows: Vec<PredictionRow>,
}

impl PredictionFrame {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
