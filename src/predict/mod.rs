//! Point predictions and simulated intervals for a fitted model.
//!
//! Intervals are empirical quantiles of simulated linear predictors:
//!
//! - ML fits draw `β ~ N(β̂, Cov β̂)` and each group intercept from its
//!   conditional distribution (`N(0, τ²)` for labels the fit never saw)
//! - Bayesian fits resample retained posterior draws
//! - optionally a residual `N(0, σ²)` is added per row
//!
//! The simulation depends only on the seed, never on the level, so bounds
//! at a wider level always contain those at a narrower one. On a log scale
//! each bound is exponentiated on its own.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::data::ObservationTable;
use crate::domain::{FittedModel, MethodKind, PredictOptions, PredictionFrame, PredictionRow, ResponseScale};
use crate::error::AppError;
use crate::math::{cholesky, draw_mvn, quantile_sorted};

fn validate(handle: &FittedModel, table: &ObservationTable, opts: &PredictOptions) -> Result<(), AppError> {
    if !(opts.level > 0.0 && opts.level < 1.0) {
        return Err(AppError::InvalidConfig(format!(
            "interval level must lie strictly between 0 and 1 (got {})",
            opts.level
        )));
    }
    if opts.intervals && opts.simulations < 100 {
        return Err(AppError::InvalidConfig(format!(
            "at least 100 simulations are required for stable quantiles (got {})",
            opts.simulations
        )));
    }
    if opts.include_residual_variance && handle.residual_variance().is_none() {
        return Err(AppError::UnsupportedInterval(format!(
            "model `{}` ({:?} family) has no residual variance to include",
            handle.label(),
            handle.family()
        )));
    }

    let spec = handle.spec();
    if table.group() != spec.group {
        return Err(AppError::spec(
            &spec.label,
            format!("prediction table is grouped by `{}`, not `{}`", table.group(), spec.group),
        ));
    }
    for column in spec.columns_used() {
        if column != spec.response && !table.has_column(column) {
            return Err(AppError::spec(
                &spec.label,
                format!("prediction table lacks column `{column}`"),
            ));
        }
    }
    Ok(())
}

/// Predict every row of `table`.
pub fn predict(handle: &FittedModel, table: &ObservationTable, opts: &PredictOptions) -> Result<PredictionFrame, AppError> {
    validate(handle, table, opts)?;

    let x = handle.layout().build(table)?;
    let mapped = handle.groups().map(table);
    let beta = DVector::from_column_slice(handle.coefficients());
    let xb = &x * &beta;

    let fit: Vec<f64> = (0..table.n_rows())
        .map(|i| {
            let u = match mapped[i] {
                Some(g) if opts.include_group_effects => handle.group_effects()[g],
                _ => 0.0,
            };
            xb[i] + u
        })
        .collect();

    let bounds = if opts.intervals {
        let sims = simulate(handle, table, &x, &mapped, opts)?;
        let lo_p = (1.0 - opts.level) / 2.0;
        let hi_p = 1.0 - lo_p;
        let mut out = Vec::with_capacity(sims.len());
        for mut row in sims {
            row.sort_by(f64::total_cmp);
            let lo = quantile_sorted(&row, lo_p);
            let hi = quantile_sorted(&row, hi_p);
            match (lo, hi) {
                (Some(lo), Some(hi)) => out.push((lo, hi)),
                _ => return Err(AppError::Numerical("empty simulation sample".to_string())),
            }
        }
        Some(out)
    } else {
        None
    };

    let natural = |v: f64| match handle.scale() {
        ResponseScale::Log => v.exp(),
        ResponseScale::Natural => v,
    };
    let rows: Vec<PredictionRow> = fit
        .iter()
        .enumerate()
        .map(|(i, &f)| {
            let (lower, upper) = match &bounds {
                Some(b) => (Some(b[i].0), Some(b[i].1)),
                None => (None, None),
            };
            PredictionRow {
                fit: f,
                lower,
                upper,
                fit_natural: natural(f),
                lower_natural: lower.map(natural),
                upper_natural: upper.map(natural),
            }
        })
        .collect();

    let finite = rows.iter().all(|r| {
        r.fit.is_finite()
            && r.fit_natural.is_finite()
            && [r.lower, r.upper, r.lower_natural, r.upper_natural]
                .iter()
                .flatten()
                .all(|v| v.is_finite())
    });
    if !finite {
        return Err(AppError::Numerical(format!(
            "model `{}`: non-finite predictions",
            handle.label()
        )));
    }

    log::info!(
        "predicted {} rows from `{}`{}",
        rows.len(),
        handle.label(),
        if opts.intervals {
            format!(" with {:.0}% intervals from {} simulations", opts.level * 100.0, opts.simulations)
        } else {
            String::new()
        }
    );

    Ok(PredictionFrame {
        model: handle.label().to_string(),
        scale: handle.scale(),
        level: opts.intervals.then_some(opts.level),
        table: table.clone(),
        rows,
    })
}

/// One parameter set per simulation.
struct Draw {
    beta: DVector<f64>,
    /// Intercept per fitted group level.
    u: Vec<f64>,
    random_variance: f64,
    residual_variance: f64,
}

/// `rows x simulations` matrix of simulated linear predictors.
fn simulate(
    handle: &FittedModel,
    table: &ObservationTable,
    x: &DMatrix<f64>,
    mapped: &[Option<usize>],
    opts: &PredictOptions,
) -> Result<Vec<Vec<f64>>, AppError> {
    let n = table.n_rows();
    let mut rng = StdRng::seed_from_u64(opts.seed);

    // Rows with a label unseen at fit time share one fresh intercept per label.
    let labels = table.group_labels();
    let mut unseen: HashMap<&str, usize> = HashMap::new();
    let unseen_idx: Vec<Option<usize>> = mapped
        .iter()
        .zip(&labels)
        .map(|(m, l)| match m {
            Some(_) => None,
            None => {
                let next = unseen.len();
                Some(*unseen.entry(*l).or_insert(next))
            }
        })
        .collect();

    let ml_lower = match handle.method() {
        MethodKind::MaximumLikelihood => Some(cholesky(handle.covariance(), "coefficient covariance")?.unpack()),
        MethodKind::Bayesian => None,
    };
    let beta_hat = DVector::from_column_slice(handle.coefficients());

    let mut sims = vec![Vec::with_capacity(opts.simulations); n];
    for _ in 0..opts.simulations {
        let draw = match (&ml_lower, handle.posterior()) {
            (Some(lower), _) => Draw {
                beta: draw_mvn(&beta_hat, lower, &mut rng),
                u: handle
                    .group_effects()
                    .iter()
                    .zip(handle.group_effect_variances())
                    .map(|(m, v)| {
                        let z: f64 = StandardNormal.sample(&mut rng);
                        m + v.max(0.0).sqrt() * z
                    })
                    .collect(),
                random_variance: handle.random_variance(),
                residual_variance: handle.residual_variance().unwrap_or(0.0),
            },
            (None, Some(post)) => {
                let d = rng.gen_range(0..post.n_draws());
                Draw {
                    beta: DVector::from_column_slice(&post.fixed[d]),
                    u: post.group[d].clone(),
                    random_variance: post.random_variance[d],
                    residual_variance: post.residual_variance[d],
                }
            }
            (None, None) => {
                return Err(AppError::Numerical(format!(
                    "model `{}` has neither a covariance nor a posterior sample",
                    handle.label()
                )));
            }
        };

        let fresh: Vec<f64> = (0..unseen.len())
            .map(|_| {
                let z: f64 = StandardNormal.sample(&mut rng);
                draw.random_variance.max(0.0).sqrt() * z
            })
            .collect();

        let xb = x * &draw.beta;
        for i in 0..n {
            let mut value = xb[i];
            if opts.include_group_effects {
                value += match (mapped[i], unseen_idx[i]) {
                    (Some(g), _) => draw.u[g],
                    (None, Some(k)) => fresh[k],
                    (None, None) => 0.0,
                };
            }
            if opts.include_residual_variance {
                let z: f64 = StandardNormal.sample(&mut rng);
                value += draw.residual_variance.sqrt() * z;
            }
            sims[i].push(value);
        }
    }
    Ok(sims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleConfig, generate_sample};
    use crate::domain::{BayesConfig, Family, FitMethod, MlConfig, ModelSpecification};
    use crate::fit::fit;

    fn table() -> ObservationTable {
        generate_sample(&SampleConfig::default())
            .unwrap()
            .with_log_column("y")
            .unwrap()
    }

    fn quad() -> ModelSpecification {
        ModelSpecification::null("quad", "log_y", "year")
            .linear("X")
            .quadratic("X", Some("X2"))
    }

    fn ml_handle(t: &ObservationTable) -> FittedModel {
        fit(&quad(), t, &FitMethod::MaximumLikelihood(MlConfig::default())).unwrap()
    }

    #[test]
    fn point_predictions_match_fitted_values() {
        let t = table();
        let h = ml_handle(&t);
        let frame = predict(
            &h,
            &t,
            &PredictOptions {
                intervals: false,
                ..PredictOptions::default()
            },
        )
        .unwrap();
        assert_eq!(frame.len(), t.n_rows());
        for (row, f) in frame.rows.iter().zip(h.fitted()) {
            assert!((row.fit - f).abs() < 1e-9);
            assert!(row.lower.is_none());
        }
        assert_eq!(frame.level, None);
    }

    #[test]
    fn wider_level_gives_wider_bounds() {
        let t = table();
        let h = ml_handle(&t);
        let narrow = predict(&h, &t, &PredictOptions { level: 0.80, ..PredictOptions::default() }).unwrap();
        let wide = predict(&h, &t, &PredictOptions { level: 0.95, ..PredictOptions::default() }).unwrap();
        for (n, w) in narrow.rows.iter().zip(&wide.rows) {
            assert!(w.lower.unwrap() <= n.lower.unwrap());
            assert!(w.upper.unwrap() >= n.upper.unwrap());
        }
    }

    #[test]
    fn natural_bounds_are_exponentiated_independently() {
        let t = table();
        let h = ml_handle(&t);
        let frame = predict(&h, &t, &PredictOptions::default()).unwrap();
        for r in &frame.rows {
            assert!(r.lower_natural.unwrap() >= 0.0);
            assert!((r.lower_natural.unwrap() - r.lower.unwrap().exp()).abs() < 1e-12);
            assert!((r.upper_natural.unwrap() - r.upper.unwrap().exp()).abs() < 1e-12);
            assert!(r.lower_natural.unwrap() <= r.upper_natural.unwrap());
        }
    }

    #[test]
    fn residual_variance_on_poisson_is_unsupported() {
        let counts = generate_sample(&SampleConfig {
            counts: true,
            ..SampleConfig::default()
        })
        .unwrap();
        let spec = ModelSpecification::null("p", "y", "year")
            .with_family(Family::Poisson)
            .linear("X");
        let h = fit(&spec, &counts, &FitMethod::MaximumLikelihood(MlConfig::default())).unwrap();
        let err = predict(&h, &counts, &PredictOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedInterval(_)));

        let ok = predict(
            &h,
            &counts,
            &PredictOptions {
                include_residual_variance: false,
                ..PredictOptions::default()
            },
        )
        .unwrap();
        assert!(ok.rows.iter().all(|r| r.lower_natural.unwrap() >= 0.0));
    }

    #[test]
    fn invalid_level_and_simulations_are_rejected() {
        let t = table();
        let h = ml_handle(&t);
        for level in [0.0, 1.0, -0.5, f64::NAN] {
            let opts = PredictOptions { level, ..PredictOptions::default() };
            assert!(matches!(predict(&h, &t, &opts), Err(AppError::InvalidConfig(_))));
        }
        let opts = PredictOptions { simulations: 10, ..PredictOptions::default() };
        assert!(matches!(predict(&h, &t, &opts), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn same_seed_same_bounds() {
        let t = table();
        let h = ml_handle(&t);
        let a = predict(&h, &t, &PredictOptions::default()).unwrap();
        let b = predict(&h, &t, &PredictOptions::default()).unwrap();
        assert_eq!(a.rows, b.rows);
    }

    #[test]
    fn bayesian_handles_resample_posterior() {
        let t = table();
        let method = FitMethod::Bayesian(BayesConfig {
            warmup: 200,
            draws: 300,
            ..BayesConfig::default()
        });
        let h = fit(&quad(), &t, &method).unwrap();
        let frame = predict(&h, &t, &PredictOptions::default()).unwrap();
        assert!(frame.rows.iter().all(|r| r.lower.unwrap() < r.upper.unwrap()));
    }
}
