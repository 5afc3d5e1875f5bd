//! Pareto-smoothed importance sampling leave-one-out (PSIS-LOO).
//!
//! For each observation the raw importance ratios are `1 / p(yᵢ | θˢ)`. The
//! largest ratios are replaced by expected order statistics of a generalized
//! Pareto distribution fitted to the tail (Zhang & Stephens estimator with a
//! weakly informative shrinkage of the shape), then truncated at the largest
//! raw ratio. The fitted shape `k` doubles as a reliability diagnostic:
//! values above 0.7 mean the estimate for that observation is unreliable.

use rayon::prelude::*;

use crate::error::AppError;
use crate::math::stats::{log_sum_exp, variance};

/// Pareto shape above which a pointwise estimate is unreliable.
pub const PARETO_K_THRESHOLD: f64 = 0.7;

const GPD_PRIOR: f64 = 3.0;
const GPD_MIN_GRID: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct LooEstimate {
    pub pointwise_elpd: Vec<f64>,
    pub pareto_k: Vec<f64>,
    pub elpd: f64,
    pub se: f64,
}

impl LooEstimate {
    pub fn n_high_k(&self) -> usize {
        self.pareto_k.iter().filter(|k| **k > PARETO_K_THRESHOLD).count()
    }
}

/// PSIS-LOO from a `draws x observations` log-likelihood matrix.
pub fn psis_loo(log_lik: &[Vec<f64>]) -> Result<LooEstimate, AppError> {
    let n_draws = log_lik.len();
    let n_obs = log_lik.first().map(Vec::len).unwrap_or(0);
    if n_draws < 2 || n_obs == 0 {
        return Err(AppError::Numerical(
            "leave-one-out needs at least two draws and one observation".to_string(),
        ));
    }
    if log_lik.iter().any(|row| row.len() != n_obs) {
        return Err(AppError::Numerical(
            "pointwise log-likelihood rows have different lengths".to_string(),
        ));
    }
    if log_lik.iter().flatten().any(|v| !v.is_finite()) {
        return Err(AppError::Numerical(
            "pointwise log-likelihood contains non-finite values".to_string(),
        ));
    }

    let pointwise: Vec<(f64, f64)> = (0..n_obs)
        .into_par_iter()
        .map(|i| {
            let ll: Vec<f64> = log_lik.iter().map(|row| row[i]).collect();
            let ratios: Vec<f64> = ll.iter().map(|v| -v).collect();
            let (lw, k) = psis_smooth(&ratios);
            let terms: Vec<f64> = lw.iter().zip(&ll).map(|(w, l)| w + l).collect();
            (log_sum_exp(&terms), k)
        })
        .collect();

    let (pointwise_elpd, pareto_k): (Vec<f64>, Vec<f64>) = pointwise.into_iter().unzip();
    if pointwise_elpd.iter().any(|v| !v.is_finite()) {
        return Err(AppError::Numerical("leave-one-out elpd is not finite".to_string()));
    }
    let elpd = pointwise_elpd.iter().sum();
    let se = (n_obs as f64 * variance(&pointwise_elpd)).sqrt();
    Ok(LooEstimate {
        pointwise_elpd,
        pareto_k,
        elpd,
        se,
    })
}

/// Smooth raw log importance ratios.
///
/// Returns normalised log weights (they log-sum-exp to zero) and the fitted
/// Pareto shape.
pub fn psis_smooth(log_ratios: &[f64]) -> (Vec<f64>, f64) {
    let s = log_ratios.len();
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|v| v - max).collect();

    let tail_len = ((0.2 * s as f64).ceil() as usize).min((3.0 * (s as f64).sqrt()).ceil() as usize);
    let mut k = 0.0;
    if tail_len >= 5 && tail_len < s {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_idx = &order[s - tail_len..];
        let cutoff = lw[order[s - tail_len - 1]];
        let exp_cutoff = cutoff.exp();

        let tail: Vec<f64> = tail_idx.iter().map(|&j| lw[j].exp() - exp_cutoff).collect();
        if let Some((shape, sigma)) = gpd_fit(&tail) {
            k = shape;
            for (rank, &j) in tail_idx.iter().enumerate() {
                let p = (rank as f64 + 0.5) / tail_len as f64;
                lw[j] = (gpd_quantile(p, shape, sigma) + exp_cutoff).ln();
            }
        }
        // Truncate at the largest raw weight (zero after the shift).
        for w in lw.iter_mut() {
            *w = w.min(0.0);
        }
    }

    let norm = log_sum_exp(&lw);
    for w in lw.iter_mut() {
        *w -= norm;
    }
    (lw, k)
}

/// Fit a generalized Pareto distribution to ascending exceedances.
///
/// Returns `(k, sigma)` or `None` when the sample is degenerate.
fn gpd_fit(x: &[f64]) -> Option<(f64, f64)> {
    let n = x.len();
    let last = *x.last()?;
    let q_idx = ((n as f64 / 4.0 + 0.5).floor() as usize).max(1) - 1;
    let xstar = x[q_idx];
    if !(xstar > 0.0 && last > 0.0) {
        return None;
    }

    let m = GPD_MIN_GRID + (n as f64).sqrt().floor() as usize;
    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / last + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / GPD_PRIOR / xstar)
        .collect();
    let profile: Vec<f64> = theta
        .iter()
        .map(|&t| {
            let a = -t;
            let k = x.iter().map(|xi| (a * xi).ln_1p()).sum::<f64>() / n as f64;
            let v = n as f64 * ((a / k).ln() - k - 1.0);
            if v.is_finite() { v } else { f64::NEG_INFINITY }
        })
        .collect();
    let norm = log_sum_exp(&profile);
    if !norm.is_finite() {
        return None;
    }
    let theta_hat: f64 = theta
        .iter()
        .zip(&profile)
        .map(|(t, l)| t * (l - norm).exp())
        .sum();

    let k = x.iter().map(|xi| (-theta_hat * xi).ln_1p()).sum::<f64>() / n as f64;
    let sigma = -k / theta_hat;
    if !(k.is_finite() && sigma.is_finite() && sigma > 0.0) {
        return None;
    }
    // Shrink towards 0.5, as if ten extra observations sat at that value.
    let k = (k * n as f64 + 10.0 * 0.5) / (n as f64 + 10.0);
    Some((k, sigma))
}

fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1e-12 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn weights_are_normalised() {
        let ratios: Vec<f64> = (0..400).map(|i| ((i * 37) % 101) as f64 / 25.0).collect();
        let (lw, k) = psis_smooth(&ratios);
        assert_relative_eq!(log_sum_exp(&lw), 0.0, epsilon = 1e-10);
        assert!(k.is_finite());
        assert!(lw.iter().all(|w| *w <= 0.0));
    }

    #[test]
    fn constant_ratios_give_uniform_weights() {
        let (lw, k) = psis_smooth(&[1.5; 200]);
        assert_eq!(k, 0.0);
        for w in lw {
            assert_relative_eq!(w, -(200.0_f64).ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn gpd_recovers_exponential_tail() {
        // Exponential exceedances have shape 0; the shrunk estimate stays small.
        let n = 400;
        let x: Vec<f64> = (1..=n)
            .map(|i| -(1.0 - (i as f64 - 0.5) / n as f64).ln())
            .collect();
        let (k, sigma) = gpd_fit(&x).unwrap();
        assert!(k.abs() < 0.1, "k = {k}");
        assert!((sigma - 1.0).abs() < 0.2, "sigma = {sigma}");
    }

    #[test]
    fn loo_is_close_to_log_predictive_density_for_stable_draws() {
        let mut rng = StdRng::seed_from_u64(9);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let base: Vec<f64> = (0..20).map(|i| -1.0 - i as f64 * 0.01).collect();
        let log_lik: Vec<Vec<f64>> = (0..500)
            .map(|_| base.iter().map(|b| b + noise.sample(&mut rng)).collect())
            .collect();
        let loo = psis_loo(&log_lik).unwrap();
        let lpd: f64 = base.iter().sum();
        assert!((loo.elpd - lpd).abs() < 0.05, "elpd {} vs {lpd}", loo.elpd);
        assert_eq!(loo.n_high_k(), 0);
    }

    #[test]
    fn ragged_matrix_is_rejected() {
        let log_lik = vec![vec![0.0, 1.0], vec![0.0]];
        assert!(matches!(psis_loo(&log_lik), Err(AppError::Numerical(_))));
    }
}
