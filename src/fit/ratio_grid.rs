//! Variance-ratio search.
//!
//! The random-intercept fitters profile every parameter except one variance
//! quantity (the ratio `τ²/σ²` for Gaussian models, `τ²` for Poisson). That
//! one-dimensional profile is maximised by:
//!
//! 1. evaluating a deterministic grid (`0` plus log-spaced points) in parallel
//! 2. refining around the best grid point with golden-section search
//!
//! The grid guards against local optima and makes the boundary case `0`
//! (a singular fit) an explicit candidate.

use rayon::prelude::*;

use crate::domain::MlConfig;
use crate::error::AppError;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, AppError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(AppError::InvalidConfig(format!(
            "invalid variance search range: min={min}, max={max} (must be finite, >0, and max>min)"
        )));
    }
    if steps < 2 {
        return Err(AppError::InvalidConfig("variance grid steps must be >= 2".to_string()));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

/// Candidate grid `[0, min, ..., max]`.
pub fn ratio_grid(config: &MlConfig) -> Result<Vec<f64>, AppError> {
    let mut grid = vec![0.0];
    grid.extend(log_space(config.ratio_min, config.ratio_max, config.grid_steps)?);
    Ok(grid)
}

/// Result of maximising a one-dimensional profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOptimum {
    pub ratio: f64,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
    /// The best grid point was the largest candidate.
    pub on_upper_bound: bool,
}

/// Maximise `objective` over `[0, config.ratio_max]`.
///
/// `objective` returns `None` where the profile is undefined; those points are
/// skipped. It must be pure: it is evaluated concurrently.
pub fn maximize_profile<F>(config: &MlConfig, objective: F) -> Result<ProfileOptimum, AppError>
where
    F: Fn(f64) -> Option<f64> + Sync,
{
    let grid = ratio_grid(config)?;
    let eval = |r: f64| objective(r).filter(|v| v.is_finite());

    let scored: Vec<(usize, f64)> = grid
        .par_iter()
        .enumerate()
        .filter_map(|(idx, &r)| eval(r).map(|v| (idx, v)))
        .collect();

    // Deterministic selection: highest value; ties go to the smaller ratio.
    let Some(&(best_idx, best_value)) = scored
        .iter()
        .reduce(|a, b| if b.1 > a.1 { b } else { a })
    else {
        return Err(AppError::Numerical(
            "likelihood is undefined at every variance grid point".to_string(),
        ));
    };

    let last = grid.len() - 1;
    if best_idx == last {
        return Ok(ProfileOptimum {
            ratio: grid[last],
            value: best_value,
            iterations: 0,
            converged: true,
            on_upper_bound: true,
        });
    }

    let lo = grid[best_idx.saturating_sub(1)];
    let hi = grid[best_idx + 1];
    let refined = golden_section(lo, hi, config.tol, config.max_iter, |r| {
        eval(r).unwrap_or(f64::NEG_INFINITY)
    });
    log::debug!(
        "variance profile: grid best {:.4e} ({best_value:.6}), refined {:.4e} ({:.6}) in {} iterations",
        grid[best_idx],
        refined.ratio,
        refined.value,
        refined.iterations
    );

    if refined.value > best_value {
        Ok(refined)
    } else {
        Ok(ProfileOptimum {
            ratio: grid[best_idx],
            value: best_value,
            ..refined
        })
    }
}

fn golden_section<F>(lo: f64, hi: f64, tol: f64, max_iter: usize, f: F) -> ProfileOptimum
where
    F: Fn(f64) -> f64,
{
    let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lo, hi);
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);

    let mut converged = false;
    let mut iterations = max_iter;
    for iter in 0..max_iter {
        if (b - a).abs() <= tol * (1.0 + a.abs() + b.abs()) {
            converged = true;
            iterations = iter;
            break;
        }
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
    }

    let mid = 0.5 * (a + b);
    let fm = f(mid);
    let (ratio, value) = [(mid, fm), (c, fc), (d, fd)]
        .into_iter()
        .fold((mid, fm), |best, cand| if cand.1 > best.1 { cand } else { best });

    ProfileOptimum {
        ratio,
        value,
        iterations,
        converged,
        on_upper_bound: false,
    }
}
