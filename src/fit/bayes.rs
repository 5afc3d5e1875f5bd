//! Gaussian random-intercept model, Gibbs sampler.
//!
//! Priors: `β ~ N(0, s₀² I)`, `σ² ~ InvGamma(a, b)`, `τ² ~ InvGamma(a, b)`.
//! Every full conditional is conjugate:
//!
//! - `β | u, σ²`: normal with precision `XᵀX/σ² + I/s₀²`
//! - `u_g | β, σ², τ²`: normal with precision `n_g/σ² + 1/τ²`
//! - `σ² | β, u`: `InvGamma(a + n/2, b + SSR/2)`
//! - `τ² | u`: `InvGamma(a + G/2, b + Σu²/2)`
//!
//! All randomness comes from one `StdRng` seeded by `BayesConfig::seed`, so a
//! fit is a pure function of its inputs.

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use statrs::distribution::{Continuous, Normal};

use crate::domain::{BayesConfig, ConvergenceWarning, FittedModel, MethodKind, ModelSpecification, Posterior};
use crate::error::AppError;
use crate::fit::fitter::ModelData;
use crate::fit::lmm::{GroupSums, marginal_log_lik};
use crate::math::{cholesky, draw_mvn_precision, mean, residual_variance, solve_least_squares};

/// `1 / Gamma(shape, rate)`.
fn draw_inv_gamma(shape: f64, rate: f64, rng: &mut StdRng) -> Result<f64, AppError> {
    let gamma = Gamma::new(shape, 1.0 / rate)
        .map_err(|e| AppError::Numerical(format!("invalid inverse-gamma ({shape}, {rate}): {e}")))?;
    let g: f64 = gamma.sample(rng);
    if g > 0.0 && g.is_finite() {
        Ok(1.0 / g)
    } else {
        Err(AppError::Numerical("inverse-gamma draw underflowed".to_string()))
    }
}

pub(crate) fn fit_gibbs(
    spec: &ModelSpecification,
    data: ModelData,
    config: &BayesConfig,
) -> Result<FittedModel, AppError> {
    config.validate()?;
    let n = data.n();
    let p = data.p();
    let n_groups = data.groups.n_groups();
    let index = data.groups.index();
    let sums = GroupSums::new(&data);
    let mut rng = StdRng::seed_from_u64(config.seed);

    // Start from OLS with the between-group spread of its residuals.
    let mut beta = solve_least_squares(&data.x, &data.y)
        .ok_or_else(|| AppError::Numerical(format!("model `{}`: design matrix is rank deficient", spec.label)))?;
    let mut sigma2 = residual_variance(&data.x, &data.y, &beta).max(1e-8);
    let mut tau2 = sigma2;
    let mut u = DVector::<f64>::zeros(n_groups);

    let prior_precision = 1.0 / (config.prior_beta_sd * config.prior_beta_sd);
    let total = config.warmup + config.draws * config.thin;

    let mut post = Posterior {
        fixed: Vec::with_capacity(config.draws),
        group: Vec::with_capacity(config.draws),
        residual_variance: Vec::with_capacity(config.draws),
        random_variance: Vec::with_capacity(config.draws),
        pointwise_log_lik: Vec::with_capacity(config.draws),
    };

    for iter in 0..total {
        // β | u, σ²
        let mut zu_x = DVector::<f64>::zeros(p);
        for (g, (_, s_g, _)) in sums.groups.iter().enumerate() {
            zu_x += s_g * u[g];
        }
        let precision = &sums.xtx / sigma2 + DMatrix::<f64>::identity(p, p) * prior_precision;
        let chol = cholesky(&precision, "fixed-effect precision")?;
        let rhs = (&sums.xty - zu_x) / sigma2;
        beta = draw_mvn_precision(&chol, &rhs, &mut rng)?;

        // u_g | β, σ², τ²
        for (g, (n_g, s_g, t_g)) in sums.groups.iter().enumerate() {
            let prec = n_g / sigma2 + 1.0 / tau2;
            let m = ((t_g - s_g.dot(&beta)) / sigma2) / prec;
            let z: f64 = StandardNormal.sample(&mut rng);
            u[g] = m + z / prec.sqrt();
        }

        // σ² | β, u
        let xb = &data.x * &beta;
        let ssr: f64 = (0..n)
            .map(|i| {
                let r = data.y[i] - xb[i] - u[index[i]];
                r * r
            })
            .sum();
        sigma2 = draw_inv_gamma(config.prior_shape + n as f64 / 2.0, config.prior_rate + ssr / 2.0, &mut rng)?;

        // τ² | u
        tau2 = draw_inv_gamma(
            config.prior_shape + n_groups as f64 / 2.0,
            config.prior_rate + u.dot(&u) / 2.0,
            &mut rng,
        )?;

        if iter >= config.warmup && (iter - config.warmup) % config.thin == 0 {
            let sd = sigma2.sqrt();
            let ll = (0..n)
                .map(|i| {
                    Normal::new(xb[i] + u[index[i]], sd)
                        .map(|d| d.ln_pdf(data.y[i]))
                        .map_err(|e| AppError::Numerical(format!("pointwise log-likelihood: {e}")))
                })
                .collect::<Result<Vec<f64>, AppError>>()?;
            post.fixed.push(beta.iter().copied().collect());
            post.group.push(u.iter().copied().collect());
            post.residual_variance.push(sigma2);
            post.random_variance.push(tau2);
            post.pointwise_log_lik.push(ll);
        }
    }

    summarize(spec, data, config, post)
}

fn column_means(draws: &[Vec<f64>], width: usize) -> Vec<f64> {
    (0..width)
        .map(|j| mean(&draws.iter().map(|d| d[j]).collect::<Vec<_>>()))
        .collect()
}

fn summarize(
    spec: &ModelSpecification,
    data: ModelData,
    config: &BayesConfig,
    post: Posterior,
) -> Result<FittedModel, AppError> {
    let p = data.p();
    let n_groups = data.groups.n_groups();
    let s = post.n_draws();
    if s < 2 {
        return Err(AppError::Numerical("too few posterior draws retained".to_string()));
    }

    let beta = column_means(&post.fixed, p);
    let u = column_means(&post.group, n_groups);
    let sigma2 = mean(&post.residual_variance);
    let tau2 = mean(&post.random_variance);

    let mut covariance = DMatrix::zeros(p, p);
    for draw in &post.fixed {
        for a in 0..p {
            for b in 0..p {
                covariance[(a, b)] += (draw[a] - beta[a]) * (draw[b] - beta[b]);
            }
        }
    }
    covariance /= (s - 1) as f64;

    let group_effect_variances: Vec<f64> = (0..n_groups)
        .map(|g| post.group.iter().map(|d| (d[g] - u[g]).powi(2)).sum::<f64>() / (s - 1) as f64)
        .collect();

    let beta_vec = DVector::from_vec(beta.clone());
    let xb = &data.x * &beta_vec;
    let fitted: Vec<f64> = data
        .groups
        .index()
        .iter()
        .enumerate()
        .map(|(i, &g)| xb[i] + u[g])
        .collect();
    let residuals: Vec<f64> = fitted.iter().zip(data.y.iter()).map(|(f, y)| y - f).collect();
    let log_likelihood = marginal_log_lik(&data, &beta_vec, sigma2, tau2 / sigma2);
    if !log_likelihood.is_finite() {
        return Err(AppError::Numerical(format!(
            "model `{}`: log-likelihood at the posterior mean is not finite",
            spec.label
        )));
    }

    let mut warnings = Vec::new();
    let ratio = tau2 / sigma2;
    if ratio < config.singular_tol {
        warnings.push(ConvergenceWarning::SingularFit { ratio });
    }
    log::debug!(
        "gibbs `{}`: {s} draws, posterior mean sigma2={sigma2:.4e}, tau2={tau2:.4e}",
        spec.label
    );

    Ok(FittedModel {
        spec: spec.clone(),
        method: MethodKind::Bayesian,
        scale: data.scale,
        coefficients: beta,
        covariance,
        group_effects: u,
        group_effect_variances,
        random_variance: tau2,
        residual_variance: Some(sigma2),
        fitted,
        residuals,
        log_likelihood,
        n_params: p + 2,
        fingerprint: data.fingerprint,
        warnings,
        posterior: Some(post),
        layout: data.layout,
        groups: data.groups,
    })
}
