//! Gaussian random-intercept model, maximum likelihood.
//!
//! Model: `y = Xβ + Zu + ε`, `u_g ~ N(0, τ²)`, `ε ~ N(0, σ²)`.
//!
//! With `θ = τ²/σ²` the marginal covariance is `σ² V₀`, where `V₀` is block
//! diagonal with blocks `I + θ 11ᵀ`. Each block inverts in closed form,
//! `I - c_g 11ᵀ` with `c_g = θ / (1 + n_g θ)`, so for fixed `θ` everything
//! reduces to per-group sums:
//!
//! - `s_g = Σ xᵢ`, `t_g = Σ yᵢ` over the rows of group `g`
//! - `A = XᵀX - Σ c_g s_g s_gᵀ`, `b = Xᵀy - Σ c_g s_g t_g`
//! - `β̂ = A⁻¹ b`, `σ̂² = (yᵀV₀⁻¹y - bᵀβ̂) / n`
//! - `logL = -n/2 (ln 2πσ̂² + 1) - ½ Σ ln(1 + n_g θ)`
//!
//! The profile in `θ` is maximised by `ratio_grid::maximize_profile`. Full ML
//! (not REML) is used so fits with different fixed effects stay comparable.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};

use crate::domain::{ConvergenceWarning, FittedModel, MethodKind, MlConfig, ModelSpecification};
use crate::error::AppError;
use crate::fit::fitter::ModelData;
use crate::fit::ratio_grid::maximize_profile;

/// Sufficient statistics for the profiled likelihood.
#[derive(Debug, Clone)]
pub(crate) struct GroupSums {
    pub xtx: DMatrix<f64>,
    pub xty: DVector<f64>,
    pub yty: f64,
    /// Per group: (n_g, s_g, t_g).
    pub groups: Vec<(f64, DVector<f64>, f64)>,
}

impl GroupSums {
    pub fn new(data: &ModelData) -> Self {
        let p = data.p();
        let mut groups: Vec<(f64, DVector<f64>, f64)> = (0..data.groups.n_groups())
            .map(|_| (0.0, DVector::zeros(p), 0.0))
            .collect();
        for (i, &g) in data.groups.index().iter().enumerate() {
            let entry = &mut groups[g];
            entry.0 += 1.0;
            entry.1 += data.x.row(i).transpose();
            entry.2 += data.y[i];
        }
        Self {
            xtx: data.x.transpose() * &data.x,
            xty: data.x.transpose() * &data.y,
            yty: data.y.dot(&data.y),
            groups,
        }
    }
}

/// Profile solution at one variance ratio.
#[derive(Debug, Clone)]
pub(crate) struct ProfilePoint {
    pub beta: DVector<f64>,
    pub sigma2: f64,
    pub a_inv: DMatrix<f64>,
    pub log_lik: f64,
}

pub(crate) fn profile_at(sums: &GroupSums, n: usize, theta: f64) -> Option<ProfilePoint> {
    let mut a = sums.xtx.clone();
    let mut b = sums.xty.clone();
    let mut quad = sums.yty;
    let mut log_det = 0.0;
    for (n_g, s_g, t_g) in &sums.groups {
        let c = theta / (1.0 + n_g * theta);
        a -= (s_g * s_g.transpose()) * c;
        b -= s_g * (c * t_g);
        quad -= c * t_g * t_g;
        log_det += (n_g * theta).ln_1p();
    }

    let chol = a.cholesky()?;
    let beta = chol.solve(&b);
    let sigma2 = (quad - b.dot(&beta)) / n as f64;
    if !(sigma2.is_finite() && sigma2 > 0.0) {
        return None;
    }
    let nf = n as f64;
    let log_lik = -0.5 * nf * ((2.0 * PI * sigma2).ln() + 1.0) - 0.5 * log_det;
    Some(ProfilePoint {
        beta,
        sigma2,
        a_inv: chol.inverse(),
        log_lik,
    })
}

/// Marginal log-likelihood at arbitrary `(β, σ², θ)`.
pub(crate) fn marginal_log_lik(data: &ModelData, beta: &DVector<f64>, sigma2: f64, theta: f64) -> f64 {
    let r = &data.y - &data.x * beta;
    let mut sums = vec![(0.0_f64, 0.0_f64); data.groups.n_groups()];
    for (i, &g) in data.groups.index().iter().enumerate() {
        sums[g].0 += 1.0;
        sums[g].1 += r[i];
    }
    let mut quad = r.dot(&r);
    let mut log_det = 0.0;
    for (n_g, r_g) in sums {
        let c = theta / (1.0 + n_g * theta);
        quad -= c * r_g * r_g;
        log_det += (n_g * theta).ln_1p();
    }
    let n = data.n() as f64;
    -0.5 * (n * (2.0 * PI * sigma2).ln() + log_det + quad / sigma2)
}

pub(crate) fn fit_gaussian(
    spec: &ModelSpecification,
    data: ModelData,
    config: &MlConfig,
) -> Result<FittedModel, AppError> {
    let n = data.n();
    let sums = GroupSums::new(&data);

    let optimum = maximize_profile(config, |theta| profile_at(&sums, n, theta).map(|pp| pp.log_lik))?;
    let theta = optimum.ratio;
    let point = profile_at(&sums, n, theta).ok_or_else(|| {
        AppError::Numerical(format!(
            "model `{}`: profiled likelihood is undefined at the optimum",
            spec.label
        ))
    })?;

    let mut warnings = Vec::new();
    if theta < config.singular_tol {
        warnings.push(ConvergenceWarning::SingularFit { ratio: theta });
    }
    if optimum.on_upper_bound {
        warnings.push(ConvergenceWarning::BoundaryEstimate { ratio: theta });
    }
    if !optimum.converged {
        warnings.push(ConvergenceWarning::IterationLimit {
            stage: "variance-ratio search".to_string(),
            iterations: optimum.iterations,
        });
    }

    // BLUPs û_g = c_g (t_g - s_gᵀβ̂) with conditional variance σ² c_g.
    let (group_effects, group_effect_variances): (Vec<f64>, Vec<f64>) = sums
        .groups
        .iter()
        .map(|(n_g, s_g, t_g)| {
            let c = theta / (1.0 + n_g * theta);
            (c * (t_g - s_g.dot(&point.beta)), point.sigma2 * c)
        })
        .unzip();

    let xb = &data.x * &point.beta;
    let fitted: Vec<f64> = data
        .groups
        .index()
        .iter()
        .enumerate()
        .map(|(i, &g)| xb[i] + group_effects[g])
        .collect();
    let residuals: Vec<f64> = fitted.iter().zip(data.y.iter()).map(|(f, y)| y - f).collect();

    if !point.log_lik.is_finite() || point.beta.iter().any(|b| !b.is_finite()) {
        return Err(AppError::Numerical(format!(
            "model `{}`: non-finite estimates",
            spec.label
        )));
    }

    let p = data.p();
    Ok(FittedModel {
        spec: spec.clone(),
        method: MethodKind::MaximumLikelihood,
        scale: data.scale,
        coefficients: point.beta.iter().copied().collect(),
        covariance: &point.a_inv * point.sigma2,
        group_effects,
        group_effect_variances,
        random_variance: theta * point.sigma2,
        residual_variance: Some(point.sigma2),
        fitted,
        residuals,
        log_likelihood: point.log_lik,
        n_params: p + 2,
        fingerprint: data.fingerprint,
        warnings,
        posterior: None,
        layout: data.layout,
        groups: data.groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, ObservationTable, SampleConfig, generate_sample};
    use crate::domain::ResponseScale;
    use approx::assert_relative_eq;

    fn data_for(spec: &ModelSpecification, table: &ObservationTable) -> ModelData {
        ModelData::prepare(spec, table).unwrap()
    }

    fn logged(cfg: &SampleConfig) -> ObservationTable {
        generate_sample(cfg).unwrap().with_log_column("y").unwrap()
    }

    #[test]
    fn zero_ratio_matches_ordinary_least_squares() {
        let table = logged(&SampleConfig::default());
        let spec = ModelSpecification::null("x", "log_y", "year").linear("X");
        let data = data_for(&spec, &table);
        let sums = GroupSums::new(&data);
        let pp = profile_at(&sums, data.n(), 0.0).unwrap();

        let beta = crate::math::solve_least_squares(&data.x, &data.y).unwrap();
        assert_relative_eq!(pp.beta[0], beta[0], epsilon = 1e-9);
        assert_relative_eq!(pp.beta[1], beta[1], epsilon = 1e-9);
    }

    #[test]
    fn profile_agrees_with_marginal_likelihood() {
        let table = logged(&SampleConfig::default());
        let spec = ModelSpecification::null("x", "log_y", "year").linear("X");
        let data = data_for(&spec, &table);
        let sums = GroupSums::new(&data);
        for theta in [0.0, 0.3, 2.5] {
            let pp = profile_at(&sums, data.n(), theta).unwrap();
            let direct = marginal_log_lik(&data, &pp.beta, pp.sigma2, theta);
            assert_relative_eq!(pp.log_lik, direct, max_relative = 1e-9);
        }
    }

    #[test]
    fn recovers_generating_parameters() {
        let cfg = SampleConfig {
            rows: 800,
            groups: 8,
            ..SampleConfig::default()
        };
        let table = logged(&cfg);
        let spec = ModelSpecification::null("q", "log_y", "year")
            .linear("X")
            .quadratic("X", Some("X2"));
        let fitted = fit_gaussian(&spec, data_for(&spec, &table), &MlConfig::default()).unwrap();

        assert!((fitted.coefficient("X").unwrap() - cfg.slope).abs() < 0.05);
        assert!((fitted.coefficient("X2").unwrap() - cfg.curvature).abs() < 0.05);
        let s2 = fitted.residual_variance().unwrap();
        assert!((s2.sqrt() - cfg.residual_sd).abs() < 0.03, "sigma {}", s2.sqrt());
        assert!(fitted.random_variance() > 0.0);
        assert_eq!(fitted.n_params(), 5);
        assert_eq!(fitted.scale(), ResponseScale::Log);
        assert!(!fitted.has_warnings());
    }

    #[test]
    fn identical_groups_give_singular_warning() {
        // Every group holds the same responses, so there is no between-group variance.
        let n = 20;
        let table = ObservationTable::from_columns(
            vec![
                (
                    "y".to_string(),
                    Column::Numeric((0..n).map(|i| Some(1.0 + (i % 5) as f64)).collect()),
                ),
                (
                    "g".to_string(),
                    Column::Categorical((0..n).map(|i| Some(format!("g{}", i / 5))).collect()),
                ),
            ],
            "y",
            "g",
        )
        .unwrap();
        let spec = ModelSpecification::null("null", "y", "g");
        let fitted = fit_gaussian(&spec, data_for(&spec, &table), &MlConfig::default()).unwrap();

        assert!(fitted.random_variance() < 1e-6);
        assert!(
            fitted
                .warnings()
                .iter()
                .any(|w| matches!(w, ConvergenceWarning::SingularFit { .. }))
        );
        assert_relative_eq!(fitted.coefficients()[0], 3.0, epsilon = 1e-9);
        assert!(fitted.log_likelihood().is_finite());
    }
}
