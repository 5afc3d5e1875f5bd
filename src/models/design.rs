//! Design matrices for structured model specifications.
//!
//! The fitters rely on two primitive operations:
//! - lay out the fixed-effect columns for a specification (`DesignLayout`)
//! - index each row's grouping level (`GroupIndex`)
//!
//! A layout is derived once from the fitting table and then reused to build
//! matrices for new tables, so prediction rows are coded exactly like the
//! rows the model was fitted on.

use std::collections::{BTreeSet, HashMap};

use nalgebra::DMatrix;

use crate::data::{Column, ObservationTable};
use crate::domain::{FixedTerm, ModelSpecification};
use crate::error::AppError;

/// One fixed-effect column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesignColumn {
    Intercept,
    /// A numeric table column used as is.
    Numeric { column: String },
    /// Square of a numeric table column, computed on the fly.
    Square { base: String },
    /// Treatment-coded indicator for one non-reference level.
    Dummy { column: String, level: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignLayout {
    columns: Vec<DesignColumn>,
    names: Vec<String>,
    /// Every level (reference included) of each categorical covariate.
    levels: Vec<(String, Vec<String>)>,
}

impl DesignLayout {
    /// Lay out the columns of `spec` against `table`.
    ///
    /// Categorical covariates expand to one dummy per level except the first
    /// (sorted) level, which is the reference.
    pub fn from_spec(spec: &ModelSpecification, table: &ObservationTable) -> Result<Self, AppError> {
        let mut columns = vec![DesignColumn::Intercept];
        let mut names = vec!["(Intercept)".to_string()];
        let mut categorical = Vec::new();

        for term in &spec.terms {
            match term {
                FixedTerm::Linear(c) => match table.column(c) {
                    Some(Column::Numeric(_)) => {
                        columns.push(DesignColumn::Numeric { column: c.clone() });
                        names.push(c.clone());
                    }
                    Some(Column::Categorical(values)) => {
                        let levels: BTreeSet<&str> = values.iter().flatten().map(String::as_str).collect();
                        if levels.len() < 2 {
                            return Err(AppError::spec(
                                &spec.label,
                                format!("categorical covariate `{c}` has fewer than two levels"),
                            ));
                        }
                        categorical.push((c.clone(), levels.iter().map(|l| l.to_string()).collect()));
                        for level in levels.into_iter().skip(1) {
                            columns.push(DesignColumn::Dummy {
                                column: c.clone(),
                                level: level.to_string(),
                            });
                            names.push(format!("{c}[{level}]"));
                        }
                    }
                    None => return Err(AppError::spec(&spec.label, format!("covariate `{c}` is absent"))),
                },
                FixedTerm::Quadratic { base, column } => {
                    match column {
                        Some(c) => columns.push(DesignColumn::Numeric { column: c.clone() }),
                        None => columns.push(DesignColumn::Square { base: base.clone() }),
                    }
                    names.push(term.display_name());
                }
            }
        }
        Ok(Self {
            columns,
            names,
            levels: categorical,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn columns(&self) -> &[DesignColumn] {
        &self.columns
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Build the `n x p` matrix for `table`.
    ///
    /// Rows with a missing covariate, or a categorical level the layout has
    /// never seen, fail with `DataValidation` listing every offending row.
    pub fn build(&self, table: &ObservationTable) -> Result<DMatrix<f64>, AppError> {
        let n = table.n_rows();
        let mut x = DMatrix::zeros(n, self.columns.len());
        let mut bad: BTreeSet<usize> = BTreeSet::new();
        let mut reasons: Vec<String> = Vec::new();

        for (j, col) in self.columns.iter().enumerate() {
            match col {
                DesignColumn::Intercept => x.column_mut(j).fill(1.0),
                DesignColumn::Numeric { column } | DesignColumn::Square { base: column } => {
                    let values = numeric_column(table, column)?;
                    let square = matches!(col, DesignColumn::Square { .. });
                    let before = bad.len();
                    for (i, v) in values.iter().enumerate() {
                        match v.filter(|v| v.is_finite()) {
                            Some(v) => x[(i, j)] = if square { v * v } else { v },
                            None => {
                                bad.insert(i);
                            }
                        }
                    }
                    if bad.len() > before {
                        reasons.push(format!("missing `{column}`"));
                    }
                }
                DesignColumn::Dummy { column, level } => {
                    let values = table.categorical(column).ok_or_else(|| {
                        AppError::Io(format!("categorical column `{column}` is absent"))
                    })?;
                    for (i, v) in values.iter().enumerate() {
                        match v {
                            Some(v) if v == level => x[(i, j)] = 1.0,
                            Some(_) => {}
                            None => {
                                bad.insert(i);
                            }
                        }
                    }
                }
            }
        }

        // Levels unseen at layout time cannot be coded.
        for (column, known) in &self.levels {
            if let Some(values) = table.categorical(column) {
                let before = bad.len();
                for (i, v) in values.iter().enumerate() {
                    match v {
                        Some(v) if known.contains(v) => {}
                        _ => {
                            bad.insert(i);
                        }
                    }
                }
                if bad.len() > before {
                    reasons.push(format!("missing or unknown level of `{column}`"));
                }
            }
        }

        if !bad.is_empty() {
            reasons.dedup();
            return Err(AppError::data(
                format!("cannot build design rows ({})", reasons.join(", ")),
                bad.into_iter().collect(),
            ));
        }
        Ok(x)
    }
}

fn numeric_column<'a>(table: &'a ObservationTable, name: &str) -> Result<&'a [Option<f64>], AppError> {
    table
        .numeric(name)
        .ok_or_else(|| AppError::Io(format!("numeric column `{name}` is absent")))
}

/// Row-to-level mapping for the grouping column.
///
/// Levels are sorted so the index is independent of row order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIndex {
    levels: Vec<String>,
    index: Vec<usize>,
    counts: Vec<usize>,
}

impl GroupIndex {
    pub fn from_table(table: &ObservationTable) -> Self {
        let labels = table.group_labels();
        let levels: Vec<String> = labels
            .iter()
            .copied()
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .map(str::to_string)
            .collect();
        let lookup: HashMap<&str, usize> = levels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();

        let mut counts = vec![0; levels.len()];
        let index: Vec<usize> = labels
            .iter()
            .map(|l| {
                let g = lookup.get(l).copied().unwrap_or_default();
                counts[g] += 1;
                g
            })
            .collect();
        Self { levels, index, counts }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn n_groups(&self) -> usize {
        self.levels.len()
    }

    /// Level of each row of the fitting table.
    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Map the rows of another table onto these levels; unseen labels map to `None`.
    pub fn map(&self, table: &ObservationTable) -> Vec<Option<usize>> {
        table
            .group_labels()
            .into_iter()
            .map(|l| self.levels.iter().position(|lvl| lvl == l))
            .collect()
    }
}
