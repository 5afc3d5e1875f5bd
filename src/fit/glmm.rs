//! Poisson random-intercept model (log link), Laplace approximation.
//!
//! For a fixed random-intercept variance `τ²` the joint mode of
//!
//! `h(β, u) = Σᵢ [yᵢ ηᵢ - exp(ηᵢ) - ln yᵢ!] - Σ_g u_g² / (2τ²)`
//!
//! is found by penalised Newton iterations with step halving. The Laplace
//! approximation of the marginal log-likelihood is then
//!
//! `logL(τ²) = h(β̂, û) - ½ Σ_g ln(1 + τ² Σ_{i∈g} μᵢ)`
//!
//! and `τ²` is chosen by the same grid + golden-section search as the
//! Gaussian ratio. `τ² = 0` degenerates to a plain Poisson GLM.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{Discrete, Poisson};
use statrs::function::factorial::ln_factorial;

use crate::domain::{ConvergenceWarning, FittedModel, MethodKind, MlConfig, ModelSpecification};
use crate::error::AppError;
use crate::fit::fitter::ModelData;
use crate::fit::ratio_grid::maximize_profile;
use crate::math::spd_inverse;

/// Joint mode for one value of `τ²`.
#[derive(Debug, Clone)]
struct Mode {
    beta: DVector<f64>,
    u: DVector<f64>,
    /// Negative Hessian of `h` at the mode, `(p + G) x (p + G)`.
    information: DMatrix<f64>,
    log_lik: f64,
    converged: bool,
    iterations: usize,
}

struct PoissonProblem<'a> {
    data: &'a ModelData,
    /// Σ ln yᵢ! (constant in the parameters).
    log_fact: f64,
    beta0: DVector<f64>,
    max_iter: usize,
}

impl<'a> PoissonProblem<'a> {
    fn new(data: &'a ModelData, max_iter: usize) -> Self {
        // Counts are checked to be non-negative integers before this point.
        let log_fact = data.y.iter().map(|y| ln_factorial(*y as u64)).sum();
        // Warm start: intercept at the log of the mean count.
        let mut beta0 = DVector::zeros(data.p());
        beta0[0] = data.y.mean().ln();
        Self {
            data,
            log_fact,
            beta0,
            max_iter,
        }
    }

    fn eta(&self, beta: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let mut eta = &self.data.x * beta;
        for (i, &g) in self.data.groups.index().iter().enumerate() {
            eta[i] += u[g];
        }
        eta
    }

    /// Penalised log-likelihood `h`; `tau2 == 0` means no random effect.
    fn objective(&self, beta: &DVector<f64>, u: &DVector<f64>, tau2: f64) -> f64 {
        let eta = self.eta(beta, u);
        let ll: f64 = eta
            .iter()
            .zip(self.data.y.iter())
            .map(|(e, y)| y * e - e.exp())
            .sum::<f64>()
            - self.log_fact;
        if tau2 > 0.0 {
            ll - u.dot(u) / (2.0 * tau2)
        } else {
            ll
        }
    }

    /// Gradient and negative Hessian of `h`; random-effect rows only when `tau2 > 0`.
    fn derivatives(&self, beta: &DVector<f64>, u: &DVector<f64>, tau2: f64) -> (DVector<f64>, DMatrix<f64>) {
        let p = self.data.p();
        let n_u = if tau2 > 0.0 { self.data.groups.n_groups() } else { 0 };
        let dim = p + n_u;
        let eta = self.eta(beta, u);

        let mut grad = DVector::zeros(dim);
        let mut info = DMatrix::zeros(dim, dim);
        for (i, &g) in self.data.groups.index().iter().enumerate() {
            let mu = eta[i].exp();
            let r = self.data.y[i] - mu;
            let xi = self.data.x.row(i);
            for a in 0..p {
                grad[a] += r * xi[a];
                for b in 0..p {
                    info[(a, b)] += mu * xi[a] * xi[b];
                }
            }
            if n_u > 0 {
                let k = p + g;
                grad[k] += r;
                info[(k, k)] += mu;
                for a in 0..p {
                    info[(a, k)] += mu * xi[a];
                    info[(k, a)] += mu * xi[a];
                }
            }
        }
        if n_u > 0 {
            for g in 0..n_u {
                grad[p + g] -= u[g] / tau2;
                info[(p + g, p + g)] += 1.0 / tau2;
            }
        }
        (grad, info)
    }

    fn mode(&self, tau2: f64) -> Option<Mode> {
        let p = self.data.p();
        let n_groups = self.data.groups.n_groups();
        let mut beta = self.beta0.clone();
        let mut u = DVector::zeros(n_groups);
        let mut current = self.objective(&beta, &u, tau2);
        let mut converged = false;
        let mut iterations = self.max_iter;

        for iter in 0..self.max_iter {
            let (grad, info) = self.derivatives(&beta, &u, tau2);
            let step = info.cholesky()?.solve(&grad);

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..30 {
                let cand_beta = &beta + step.rows(0, p) * scale;
                let cand_u = if tau2 > 0.0 {
                    &u + step.rows(p, n_groups) * scale
                } else {
                    u.clone()
                };
                let value = self.objective(&cand_beta, &cand_u, tau2);
                if value.is_finite() && value >= current - 1e-12 {
                    accepted = Some((cand_beta, cand_u, value));
                    break;
                }
                scale *= 0.5;
            }
            let (next_beta, next_u, value) = accepted?;
            let change = (value - current).abs();
            let max_step = step.amax() * scale;
            beta = next_beta;
            u = next_u;
            current = value;
            if max_step < 1e-8 || change < 1e-10 * (1.0 + current.abs()) {
                converged = true;
                iterations = iter + 1;
                break;
            }
        }

        let (_, information) = self.derivatives(&beta, &u, tau2);
        let eta = self.eta(&beta, &u);
        let log_lik = if tau2 > 0.0 {
            let mut mu_sums = vec![0.0; n_groups];
            for (i, &g) in self.data.groups.index().iter().enumerate() {
                mu_sums[g] += eta[i].exp();
            }
            current - 0.5 * mu_sums.iter().map(|m| (tau2 * m).ln_1p()).sum::<f64>()
        } else {
            current
        };
        if !log_lik.is_finite() {
            return None;
        }
        Some(Mode {
            beta,
            u,
            information,
            log_lik,
            converged,
            iterations,
        })
    }
}

/// Counts must be finite, non-negative integers and not all zero.
fn check_counts(spec: &ModelSpecification, y: &DVector<f64>) -> Result<(), AppError> {
    let bad: Vec<usize> = y
        .iter()
        .enumerate()
        .filter(|(_, v)| !(v.is_finite() && **v >= 0.0 && v.fract() == 0.0))
        .map(|(i, _)| i)
        .collect();
    if !bad.is_empty() {
        return Err(AppError::data(
            format!("model `{}`: poisson response must be non-negative integers", spec.label),
            bad,
        ));
    }
    if y.iter().all(|v| *v == 0.0) {
        return Err(AppError::Numerical(format!(
            "model `{}`: every count is zero; the log-mean is unbounded",
            spec.label
        )));
    }
    Ok(())
}

pub(crate) fn fit_poisson(
    spec: &ModelSpecification,
    data: ModelData,
    config: &MlConfig,
) -> Result<FittedModel, AppError> {
    check_counts(spec, &data.y)?;
    let problem = PoissonProblem::new(&data, config.inner_max_iter);

    let optimum = maximize_profile(config, |tau2| problem.mode(tau2).map(|m| m.log_lik))?;
    let tau2 = optimum.ratio;
    let mode = problem.mode(tau2).ok_or_else(|| {
        AppError::Numerical(format!(
            "model `{}`: Laplace approximation failed at the optimum",
            spec.label
        ))
    })?;

    let mut warnings = Vec::new();
    if tau2 < config.singular_tol {
        warnings.push(ConvergenceWarning::SingularFit { ratio: tau2 });
    }
    if optimum.on_upper_bound {
        warnings.push(ConvergenceWarning::BoundaryEstimate { ratio: tau2 });
    }
    if !optimum.converged {
        warnings.push(ConvergenceWarning::IterationLimit {
            stage: "variance search".to_string(),
            iterations: optimum.iterations,
        });
    }
    if !mode.converged {
        warnings.push(ConvergenceWarning::IterationLimit {
            stage: "penalised Newton".to_string(),
            iterations: mode.iterations,
        });
    }

    let p = data.p();
    let n_groups = data.groups.n_groups();
    let inv = spd_inverse(&mode.information, "Poisson information matrix")?;
    let covariance = inv.view((0, 0), (p, p)).into_owned();
    let group_effect_variances: Vec<f64> = if tau2 > 0.0 {
        (0..n_groups).map(|g| inv[(p + g, p + g)]).collect()
    } else {
        vec![0.0; n_groups]
    };

    let eta = problem.eta(&mode.beta, &mode.u);
    let residuals: Vec<f64> = eta
        .iter()
        .zip(data.y.iter())
        .map(|(e, y)| y - e.exp())
        .collect();
    let pointwise_check = data
        .y
        .iter()
        .zip(eta.iter())
        .all(|(y, e)| Poisson::new(e.exp()).is_ok_and(|d| d.ln_pmf(*y as u64).is_finite()));
    if !pointwise_check || mode.beta.iter().any(|b| !b.is_finite()) {
        return Err(AppError::Numerical(format!(
            "model `{}`: non-finite estimates",
            spec.label
        )));
    }

    Ok(FittedModel {
        spec: spec.clone(),
        method: MethodKind::MaximumLikelihood,
        scale: data.scale,
        coefficients: mode.beta.iter().copied().collect(),
        covariance,
        group_effects: mode.u.iter().copied().collect(),
        group_effect_variances,
        random_variance: tau2,
        residual_variance: None,
        fitted: eta.iter().copied().collect(),
        residuals,
        log_likelihood: mode.log_lik,
        n_params: p + 1,
        fingerprint: data.fingerprint,
        warnings,
        posterior: None,
        layout: data.layout,
        groups: data.groups,
    })
}
