//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the math/fitting code stays clean and testable
//! - output changes are localized (important for future snapshot tests)

use crate::domain::{FittedModel, PredictionFrame, SelectionReport};
use crate::error::AppError;
use crate::report::ResidualDiagnostics;

/// One line per attempted specification: fitted, or why not.
pub fn format_fit_status(results: &[(String, Result<&FittedModel, &AppError>)]) -> String {
    let mut out = String::new();
    out.push_str("Fits:\n");
    for (label, result) in results {
        match result {
            Ok(fit) => {
                let flag = if fit.has_warnings() { " (warnings)" } else { "" };
                out.push_str(&format!(
                    "  {:<16} ok  logL={:.3} k={}{flag}\n",
                    truncate(label, 16),
                    fit.log_likelihood(),
                    fit.n_params()
                ));
            }
            Err(e) => out.push_str(&format!("  {:<16} FAILED  {e}\n", truncate(label, 16))),
        }
    }
    out
}

/// Ranked selection table.
pub fn format_selection(report: &SelectionReport) -> String {
    let mut out = String::new();
    let loo = report.rows.iter().any(|r| r.se_delta.is_some());
    let name = report.criterion.display_name();

    out.push_str(&format!(
        "Model comparison: {name} (n={}, negligible difference < {})\n",
        report.n_obs, report.negligible_delta
    ));
    let mut header = format!(
        "{:>4} {:<16} {:>3} {:>12} {:>12} {:>9} {:>10} {:<5} {:<4}",
        "rank", "model", "k", "logL", name, "delta", "vs_null", "tie", "warn"
    );
    if loo {
        header.push_str(&format!(" {:>8} {:>6}", "se", "k>0.7"));
    }
    out.push_str(header.trim_end());
    out.push('\n');
    let width = header.trim_end().chars().count();
    out.push_str(&"-".repeat(width));
    out.push('\n');

    for r in &report.rows {
        let mut line = format!(
            "{:>4} {:<16} {:>3} {:>12.3} {:>12.3} {:>9.3} {:>10} {:<5} {:<4}",
            r.rank,
            truncate(&r.label, 16),
            r.n_params,
            r.log_likelihood,
            r.score,
            r.delta_from_best,
            fmt_opt(r.delta_from_null, 3),
            if r.indistinguishable_from_best { "yes" } else { "" },
            if r.convergence_warning { "yes" } else { "" },
        );
        if loo {
            line.push_str(&format!(
                " {:>8} {:>6}",
                fmt_opt(r.se_delta, 3),
                r.high_pareto_k.map(|k| k.to_string()).unwrap_or_default()
            ));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    out.push('\n');
    if report.sole_winner {
        out.push_str(&format!("Best model: {}\n", report.best));
    } else {
        out.push_str(&format!(
            "Best model: {} (indistinguishable from: {})\n",
            report.best,
            report.tied_with_best.join(", ")
        ));
    }
    if report.null_label.is_none() {
        out.push_str("No null model in the comparison set; deltas from null omitted.\n");
    }
    out
}

/// Coefficients, variance components and warnings of one fit.
pub fn format_fit_summary(fit: &FittedModel) -> String {
    let mut out = String::new();
    out.push_str(&format!("Model `{}`: {}\n", fit.label(), fit.spec().formula()));
    out.push_str(&format!(
        "- method: {:?}, family: {:?}, scale: {:?}, n={}\n",
        fit.method(),
        fit.family(),
        fit.scale(),
        fit.n_obs()
    ));

    out.push_str(&format!("  {:<20} {:>12} {:>12}\n", "term", "estimate", "std.err"));
    for ((name, est), se) in fit
        .coefficient_names()
        .iter()
        .zip(fit.coefficients())
        .zip(fit.std_errors())
    {
        out.push_str(&format!("  {:<20} {:>12.6} {:>12.6}\n", truncate(name, 20), est, se));
    }

    out.push_str(&format!(
        "- group variance ({}): {:.6} over {} levels\n",
        fit.spec().group,
        fit.random_variance(),
        fit.groups().n_groups()
    ));
    if let Some(s2) = fit.residual_variance() {
        out.push_str(&format!("- residual variance: {s2:.6}\n"));
    }
    if let Some(icc) = fit.icc() {
        out.push_str(&format!("- ICC: {icc:.4}\n"));
    }
    out.push_str(&format!("- group effects: {}\n", fmt_vec(fit.group_effects())));
    if let Some(post) = fit.posterior() {
        out.push_str(&format!("- posterior draws: {}\n", post.n_draws()));
    }
    for w in fit.warnings() {
        out.push_str(&format!("! {w}\n"));
    }
    out
}

/// Residual summary and largest residuals.
pub fn format_residuals(diag: &ResidualDiagnostics) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Residuals: n={} mean={:.4} sd={:.4}\n",
        diag.n, diag.mean, diag.sd
    ));
    for (label, n, m) in &diag.by_group {
        out.push_str(&format!("  {:<12} n={:<5} mean={:>9.4}\n", truncate(label, 12), n, m));
    }
    if !diag.largest.is_empty() {
        out.push_str("Largest residuals:\n");
        out.push_str(&format!("  {:>6} {:<12} {:>12} {:>12}\n", "row", "group", "fitted", "residual"));
        for r in &diag.largest {
            out.push_str(&format!(
                "  {:>6} {:<12} {:>12.4} {:>12.4}\n",
                r.row,
                truncate(&r.group, 12),
                r.fitted,
                r.residual
            ));
        }
    }
    out
}

/// Short prediction summary with the first `head` rows.
pub fn format_prediction_summary(frame: &PredictionFrame, head: usize) -> String {
    let mut out = String::new();
    let level = frame
        .level
        .map(|l| format!("{:.0}% intervals", l * 100.0))
        .unwrap_or_else(|| "no intervals".to_string());
    out.push_str(&format!(
        "Predictions from `{}` ({} rows, {:?} scale, {level})\n",
        frame.model,
        frame.len(),
        frame.scale
    ));
    out.push_str(&format!(
        "{:>6} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}\n",
        "row", "fit", "lower", "upper", "fit_nat", "lower_nat", "upper_nat"
    ));
    for (i, r) in frame.rows.iter().take(head).enumerate() {
        out.push_str(&format!(
            "{:>6} {:>12.4} {:>12} {:>12} {:>12.4} {:>12} {:>12}\n",
            i,
            r.fit,
            fmt_opt(r.lower, 4),
            fmt_opt(r.upper, 4),
            r.fit_natural,
            fmt_opt(r.lower_natural, 4),
            fmt_opt(r.upper_natural, 4),
        ));
    }
    if frame.len() > head {
        out.push_str(&format!("... {} more rows\n", frame.len() - head));
    }
    out
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map(|x| format!("{x:.decimals$}")).unwrap_or_default()
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Criterion, IcKind, SelectionRow};

    fn row(label: &str, rank: usize, score: f64, tie: bool) -> SelectionRow {
        SelectionRow {
            label: label.to_string(),
            formula: format!("y ~ 1 + (1 | g) [{label}]"),
            score,
            rank,
            delta_from_best: score - 100.0,
            delta_from_null: Some(score - 101.0),
            indistinguishable_from_best: tie,
            n_params: 3,
            log_likelihood: -47.0,
            convergence_warning: false,
            se_delta: None,
            high_pareto_k: None,
        }
    }

    #[test]
    fn selection_table_lists_rows_and_ties() {
        let report = SelectionReport {
            criterion: Criterion::InformationCriterion(IcKind::Aic),
            negligible_delta: 2.0,
            n_obs: 50,
            rows: vec![row("quad", 1, 100.0, true), row("null", 2, 101.0, true)],
            best: "quad".to_string(),
            tied_with_best: vec!["null".to_string()],
            sole_winner: false,
            null_label: Some("null".to_string()),
        };
        let s = format_selection(&report);
        assert!(s.contains("AIC"));
        assert!(s.contains("quad"));
        assert!(s.contains("indistinguishable from: null"));
        assert_eq!(s.lines().filter(|l| l.contains("yes")).count(), 2);
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 4), "abc.");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
