//! Model selection by information criterion or PSIS-LOO.
//!
//! For each fitted model the selector computes one score:
//! - AIC  = -2 logL + 2k
//! - AICc = AIC + 2k(k+1) / (n-k-1)
//! - BIC  = -2 logL + k ln n
//! - elpd_loo from the retained posterior draws (higher is better)
//!
//! Selection rules:
//! 1. Models must share response, family, scale and observation rows
//! 2. Rank best first; equal scores keep input order
//! 3. Models within `negligible_delta` of the best are reported as
//!    indistinguishable from it rather than losing outright

use rayon::prelude::*;

use crate::domain::{
    Criterion, FittedModel, IcKind, MethodKind, SelectionConfig, SelectionReport, SelectionRow,
};
use crate::error::AppError;
use crate::math::{LooEstimate, psis_loo, variance};

/// Information criterion for one fit.
pub fn information_criterion(kind: IcKind, log_lik: f64, k: usize, n: usize) -> Result<f64, AppError> {
    let kf = k as f64;
    let nf = n as f64;
    let aic = -2.0 * log_lik + 2.0 * kf;
    let score = match kind {
        IcKind::Aic => aic,
        IcKind::Aicc => {
            if n <= k + 1 {
                return Err(AppError::InvalidConfig(format!(
                    "AICc needs more than k + 1 = {} observations (got {n})",
                    k + 1
                )));
            }
            aic + 2.0 * kf * (kf + 1.0) / (nf - kf - 1.0)
        }
        IcKind::Bic => -2.0 * log_lik + kf * nf.ln(),
    };
    if score.is_finite() {
        Ok(score)
    } else {
        Err(AppError::Numerical(format!("information criterion is not finite (logL={log_lik})")))
    }
}

/// Leave-one-out estimate for a Bayesian fit.
pub fn loo(handle: &FittedModel) -> Result<LooEstimate, AppError> {
    let post = handle.posterior().ok_or_else(|| {
        AppError::IncomparableModels(format!(
            "model `{}` has no posterior sample; leave-one-out needs Bayesian fits",
            handle.label()
        ))
    })?;
    psis_loo(&post.pointwise_log_lik)
}

fn check_comparable(handles: &[FittedModel]) -> Result<(), AppError> {
    let Some(first) = handles.first() else {
        return Err(AppError::IncomparableModels("no fitted models to compare".to_string()));
    };
    for h in &handles[1..] {
        let mismatch = if h.spec().response != first.spec().response {
            Some(format!("response `{}` vs `{}`", h.spec().response, first.spec().response))
        } else if h.family() != first.family() {
            Some(format!("family {:?} vs {:?}", h.family(), first.family()))
        } else if h.scale() != first.scale() {
            Some(format!("response scale {:?} vs {:?}", h.scale(), first.scale()))
        } else if h.n_obs() != first.n_obs() {
            Some(format!("{} vs {} observations", h.n_obs(), first.n_obs()))
        } else if h.fingerprint() != first.fingerprint() {
            Some("fitted on different response values".to_string())
        } else {
            None
        };
        if let Some(why) = mismatch {
            return Err(AppError::IncomparableModels(format!(
                "`{}` and `{}`: {why}",
                first.label(),
                h.label()
            )));
        }
    }
    Ok(())
}

fn require_method(handles: &[FittedModel], method: MethodKind, criterion: Criterion) -> Result<(), AppError> {
    if let Some(h) = handles.iter().find(|h| h.method() != method) {
        return Err(AppError::IncomparableModels(format!(
            "model `{}` was fitted with {:?}; {} needs {:?} fits",
            h.label(),
            h.method(),
            criterion.display_name(),
            method
        )));
    }
    Ok(())
}

/// Rank fitted models.
pub fn select(handles: &[FittedModel], config: &SelectionConfig) -> Result<SelectionReport, AppError> {
    if !(config.negligible_delta.is_finite() && config.negligible_delta >= 0.0) {
        return Err(AppError::InvalidConfig(format!(
            "negligible score difference must be finite and >= 0 (got {})",
            config.negligible_delta
        )));
    }
    check_comparable(handles)?;
    let n = handles[0].n_obs();

    // `badness` is lower-is-better for every criterion.
    let (scores, badness, loos): (Vec<f64>, Vec<f64>, Option<Vec<LooEstimate>>) = match config.criterion {
        Criterion::InformationCriterion(kind) => {
            require_method(handles, MethodKind::MaximumLikelihood, config.criterion)?;
            let scores = handles
                .iter()
                .map(|h| information_criterion(kind, h.log_likelihood(), h.n_params(), n))
                .collect::<Result<Vec<_>, _>>()?;
            (scores.clone(), scores, None)
        }
        Criterion::LeaveOneOut => {
            require_method(handles, MethodKind::Bayesian, config.criterion)?;
            let loos = handles.par_iter().map(loo).collect::<Result<Vec<_>, _>>()?;
            let scores: Vec<f64> = loos.iter().map(|l| l.elpd).collect();
            let badness = scores.iter().map(|s| -s).collect();
            (scores, badness, Some(loos))
        }
    };

    let mut order: Vec<usize> = (0..handles.len()).collect();
    order.sort_by(|&a, &b| badness[a].total_cmp(&badness[b]));
    let best = order[0];

    let null = handles.iter().position(|h| h.spec().is_null());
    let tied: Vec<usize> = order[1..]
        .iter()
        .copied()
        .filter(|&i| badness[i] - badness[best] < config.negligible_delta)
        .collect();

    let rows: Vec<SelectionRow> = order
        .iter()
        .enumerate()
        .map(|(rank, &i)| {
            let h = &handles[i];
            let delta = badness[i] - badness[best];
            let (se_delta, high_pareto_k) = match &loos {
                Some(loos) => {
                    let se = if i == best {
                        0.0
                    } else {
                        let diffs: Vec<f64> = loos[best]
                            .pointwise_elpd
                            .iter()
                            .zip(&loos[i].pointwise_elpd)
                            .map(|(b, x)| b - x)
                            .collect();
                        (n as f64 * variance(&diffs)).sqrt()
                    };
                    (Some(se), Some(loos[i].n_high_k()))
                }
                None => (None, None),
            };
            SelectionRow {
                label: h.label().to_string(),
                formula: h.spec().formula(),
                score: scores[i],
                rank: rank + 1,
                delta_from_best: delta,
                delta_from_null: null.map(|j| badness[i] - badness[j]),
                indistinguishable_from_best: if i == best { !tied.is_empty() } else { tied.contains(&i) },
                n_params: h.n_params(),
                log_likelihood: h.log_likelihood(),
                convergence_warning: h.has_warnings(),
                se_delta,
                high_pareto_k,
            }
        })
        .collect();

    log::info!(
        "selected `{}` by {} among {} models ({} tied)",
        handles[best].label(),
        config.criterion.display_name(),
        handles.len(),
        tied.len()
    );

    Ok(SelectionReport {
        criterion: config.criterion,
        negligible_delta: config.negligible_delta,
        n_obs: n,
        rows,
        best: handles[best].label().to_string(),
        tied_with_best: tied.iter().map(|&i| handles[i].label().to_string()).collect(),
        sole_winner: tied.is_empty(),
        null_label: null.map(|j| handles[j].label().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ObservationTable, SampleConfig, generate_sample};
    use crate::domain::{BayesConfig, FitMethod, MlConfig, ModelSpecification};
    use crate::fit::fit;
    use approx::assert_relative_eq;

    fn table() -> ObservationTable {
        generate_sample(&SampleConfig::default())
            .unwrap()
            .with_log_column("y")
            .unwrap()
    }

    fn ml_fit(spec: &ModelSpecification, t: &ObservationTable) -> FittedModel {
        fit(spec, t, &FitMethod::MaximumLikelihood(MlConfig::default())).unwrap()
    }

    /// Clone a handle with a chosen log-likelihood so score gaps are exact.
    fn with_log_lik(h: &FittedModel, label: &str, log_lik: f64) -> FittedModel {
        let mut out = h.clone();
        out.spec.label = label.to_string();
        out.log_likelihood = log_lik;
        out
    }

    #[test]
    fn ic_formulas() {
        assert_relative_eq!(information_criterion(IcKind::Aic, -10.0, 3, 50).unwrap(), 26.0);
        assert_relative_eq!(
            information_criterion(IcKind::Aicc, -10.0, 3, 50).unwrap(),
            26.0 + 24.0 / 46.0
        );
        assert_relative_eq!(
            information_criterion(IcKind::Bic, -10.0, 3, 50).unwrap(),
            20.0 + 3.0 * 50.0_f64.ln()
        );
        assert!(information_criterion(IcKind::Aicc, -10.0, 3, 4).is_err());
    }

    #[test]
    fn clear_gap_is_not_indistinguishable() {
        let t = table();
        let base = ml_fit(&ModelSpecification::null("m", "log_y", "year").linear("X"), &t);
        // Same k, logL gap of 1.5 gives an AIC gap of 3.
        let a = with_log_lik(&base, "a", -100.0);
        let b = with_log_lik(&base, "b", -101.5);
        let report = select(&[b, a], &SelectionConfig::default()).unwrap();
        assert_eq!(report.best, "a");
        assert!(report.sole_winner);
        assert_eq!(report.rows[0].label, "a");
        assert!(!report.row("b").unwrap().indistinguishable_from_best);
        assert_relative_eq!(report.row("b").unwrap().delta_from_best, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn small_gap_is_indistinguishable() {
        let t = table();
        let base = ml_fit(&ModelSpecification::null("m", "log_y", "year").linear("X"), &t);
        let a = with_log_lik(&base, "a", -100.0);
        let b = with_log_lik(&base, "b", -100.5);
        let report = select(&[a, b], &SelectionConfig::default()).unwrap();
        assert!(!report.sole_winner);
        assert_eq!(report.tied_with_best, vec!["b".to_string()]);
        assert!(report.row("a").unwrap().indistinguishable_from_best);
        assert!(report.row("b").unwrap().indistinguishable_from_best);
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let t = table();
        let base = ml_fit(&ModelSpecification::null("m", "log_y", "year").linear("X"), &t);
        let a = with_log_lik(&base, "first", -50.0);
        let b = with_log_lik(&base, "second", -50.0);
        let report = select(&[a, b], &SelectionConfig::default()).unwrap();
        assert_eq!(report.best, "first");
        assert_eq!(report.rows[1].rank, 2);
    }

    #[test]
    fn null_deltas_are_negative_for_better_models() {
        let t = table();
        let null = ml_fit(&ModelSpecification::null("null", "log_y", "year"), &t);
        let quad = ml_fit(
            &ModelSpecification::null("quad", "log_y", "year")
                .linear("X")
                .quadratic("X", Some("X2")),
            &t,
        );
        let report = select(&[null, quad], &SelectionConfig::default()).unwrap();
        assert_eq!(report.null_label.as_deref(), Some("null"));
        assert_eq!(report.best, "quad");
        assert!(report.row("quad").unwrap().delta_from_null.unwrap() < 0.0);
        assert_eq!(report.row("null").unwrap().delta_from_null, Some(0.0));
    }

    #[test]
    fn different_responses_are_incomparable() {
        let t = table();
        let a = ml_fit(&ModelSpecification::null("log", "log_y", "year"), &t);
        let b = ml_fit(&ModelSpecification::null("raw", "y", "year"), &t);
        assert!(matches!(
            select(&[a, b], &SelectionConfig::default()),
            Err(AppError::IncomparableModels(_))
        ));
    }

    #[test]
    fn same_response_on_different_rows_is_incomparable() {
        let other = generate_sample(&SampleConfig {
            seed: 7,
            ..SampleConfig::default()
        })
        .unwrap()
        .with_log_column("y")
        .unwrap();
        let spec = ModelSpecification::null("null", "log_y", "year");
        let a = ml_fit(&spec, &table());
        let b = ml_fit(&spec.clone().linear("X"), &other);
        assert_eq!(a.n_obs(), b.n_obs());
        match select(&[a, b], &SelectionConfig::default()) {
            Err(AppError::IncomparableModels(msg)) => assert!(msg.contains("different response values")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn different_observation_counts_are_incomparable() {
        let fewer = generate_sample(&SampleConfig {
            rows: 150,
            ..SampleConfig::default()
        })
        .unwrap()
        .with_log_column("y")
        .unwrap();
        let spec = ModelSpecification::null("null", "log_y", "year");
        let a = ml_fit(&spec, &table());
        let b = ml_fit(&spec, &fewer);
        match select(&[a, b], &SelectionConfig::default()) {
            Err(AppError::IncomparableModels(msg)) => assert!(msg.contains("150 observations")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_incomparable() {
        assert!(matches!(
            select(&[], &SelectionConfig::default()),
            Err(AppError::IncomparableModels(_))
        ));
    }

    #[test]
    fn loo_requires_bayesian_fits() {
        let t = table();
        let a = ml_fit(&ModelSpecification::null("null", "log_y", "year"), &t);
        let cfg = SelectionConfig {
            criterion: Criterion::LeaveOneOut,
            ..SelectionConfig::default()
        };
        assert!(matches!(select(&[a], &cfg), Err(AppError::IncomparableModels(_))));
    }

    #[test]
    fn loo_ranks_bayesian_fits() {
        let t = table();
        let method = FitMethod::Bayesian(BayesConfig {
            warmup: 200,
            draws: 400,
            ..BayesConfig::default()
        });
        let null = fit(&ModelSpecification::null("null", "log_y", "year"), &t, &method).unwrap();
        let quad = fit(
            &ModelSpecification::null("quad", "log_y", "year")
                .linear("X")
                .quadratic("X", Some("X2")),
            &t,
            &method,
        )
        .unwrap();
        let cfg = SelectionConfig {
            criterion: Criterion::LeaveOneOut,
            ..SelectionConfig::default()
        };
        let report = select(&[null, quad], &cfg).unwrap();
        assert_eq!(report.best, "quad");
        let null_row = report.row("null").unwrap();
        assert!(null_row.se_delta.unwrap() > 0.0);
        assert!(null_row.delta_from_best > 0.0);
        assert!(report.rows.iter().all(|r| r.score.is_finite()));
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let cfg = SelectionConfig {
            negligible_delta: -1.0,
            ..SelectionConfig::default()
        };
        assert!(matches!(select(&[], &cfg), Err(AppError::InvalidConfig(_))));
    }
}
