//! Reporting utilities: residual diagnostics and formatted terminal output.

pub mod format;

pub use format::*;

use crate::domain::FittedModel;
use crate::math::{mean, variance};

/// One observation's residual.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualRow {
    pub row: usize,
    pub group: String,
    pub fitted: f64,
    pub residual: f64,
}

/// Residual summary for a fitted model (the numeric stand-in for diagnostic plots).
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualDiagnostics {
    pub n: usize,
    pub mean: f64,
    pub sd: f64,
    /// Per group level: (label, count, mean residual).
    pub by_group: Vec<(String, usize, f64)>,
    /// Largest absolute residuals, largest first.
    pub largest: Vec<ResidualRow>,
}

/// Summarise residuals and rank the `top_n` largest in absolute value.
pub fn residual_diagnostics(fit: &FittedModel, top_n: usize) -> ResidualDiagnostics {
    let residuals = fit.residuals();
    let groups = fit.groups();

    let mut per_group: Vec<Vec<f64>> = vec![Vec::new(); groups.n_groups()];
    for (&g, &r) in groups.index().iter().zip(residuals) {
        per_group[g].push(r);
    }
    let by_group = groups
        .levels()
        .iter()
        .zip(&per_group)
        .map(|(label, rs)| (label.clone(), rs.len(), mean(rs)))
        .collect();

    let mut rows: Vec<ResidualRow> = residuals
        .iter()
        .zip(fit.fitted())
        .zip(groups.index())
        .enumerate()
        .map(|(row, ((&residual, &fitted), &g))| ResidualRow {
            row,
            group: groups.levels()[g].clone(),
            fitted,
            residual,
        })
        .collect();
    rows.sort_by(|a, b| b.residual.abs().total_cmp(&a.residual.abs()).then(a.row.cmp(&b.row)));
    rows.truncate(top_n);

    ResidualDiagnostics {
        n: residuals.len(),
        mean: mean(residuals),
        sd: variance(residuals).sqrt(),
        by_group,
        largest: rows,
    }
}
