//! In-memory observation table.
//!
//! Columnar storage with one numeric or categorical vector per column. The
//! table knows its response and grouping columns and validates them on
//! construction, so every downstream stage can rely on:
//!
//! - a non-empty grouping label on every row
//! - a finite response on every row
//! - strictly positive source values for any log-derived column

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One table column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell rendered for CSV export (empty when missing).
    pub fn cell(&self, row: usize) -> String {
        match self {
            Column::Numeric(v) => v
                .get(row)
                .copied()
                .flatten()
                .map(|x| x.to_string())
                .unwrap_or_default(),
            Column::Categorical(v) => v.get(row).cloned().flatten().unwrap_or_default(),
        }
    }
}

/// Transformations the table can derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Log,
}

/// Provenance of a derived column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub source: String,
    pub transform: Transform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTable {
    names: Vec<String>,
    columns: Vec<Column>,
    response: String,
    group: String,
    derived: Vec<(String, Derivation)>,
    n_rows: usize,
}

impl ObservationTable {
    /// Build a table from named columns and validate the response/group invariants.
    ///
    /// A numeric grouping column is converted to labels (integral values print
    /// without a decimal point, so `2010.0` becomes `"2010"`).
    pub fn from_columns(
        columns: Vec<(String, Column)>,
        response: &str,
        group: &str,
    ) -> Result<Self, AppError> {
        Self::build(columns, response, group, false)
    }

    /// As [`ObservationTable::from_columns`], then add `log_<response>`.
    ///
    /// Missing, non-finite and non-positive responses are reported together
    /// in one error.
    pub fn from_columns_log_response(
        columns: Vec<(String, Column)>,
        response: &str,
        group: &str,
    ) -> Result<Self, AppError> {
        Self::build(columns, response, group, true)?.with_log_column(response)
    }

    fn build(
        columns: Vec<(String, Column)>,
        response: &str,
        group: &str,
        positive_response: bool,
    ) -> Result<Self, AppError> {
        let n_rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        if n_rows == 0 {
            return Err(AppError::data("table has no rows", Vec::new()));
        }

        let mut names = Vec::with_capacity(columns.len());
        let mut cols = Vec::with_capacity(columns.len());
        for (name, col) in columns {
            if names.contains(&name) {
                return Err(AppError::Io(format!("duplicate column `{name}`")));
            }
            if col.len() != n_rows {
                return Err(AppError::Io(format!(
                    "column `{name}` has {} values, expected {n_rows}",
                    col.len()
                )));
            }
            let col = if name == group {
                into_labels(col)
            } else {
                col
            };
            names.push(name);
            cols.push(col);
        }

        let table = Self {
            names,
            columns: cols,
            response: response.to_string(),
            group: group.to_string(),
            derived: Vec::new(),
            n_rows,
        };
        table.check_group()?;
        table.check_response(positive_response)?;
        Ok(table)
    }

    fn check_group(&self) -> Result<(), AppError> {
        let Some(Column::Categorical(labels)) = self.column(&self.group) else {
            return Err(AppError::Io(format!("grouping column `{}` is absent", self.group)));
        };
        let missing: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.as_deref().map(str::trim).unwrap_or("").is_empty())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::data(
                format!("missing grouping label in `{}`", self.group),
                missing,
            ));
        }
        Ok(())
    }

    fn check_response(&self, positive: bool) -> Result<(), AppError> {
        match self.column(&self.response) {
            Some(Column::Numeric(values)) => {
                let bad: Vec<usize> = values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_some_and(|x| x.is_finite() && (!positive || x > 0.0)))
                    .map(|(i, _)| i)
                    .collect();
                if bad.is_empty() {
                    Ok(())
                } else if positive {
                    Err(AppError::data(
                        format!(
                            "missing, non-numeric or non-positive response `{}` (log transform needs values > 0)",
                            self.response
                        ),
                        bad,
                    ))
                } else {
                    Err(AppError::data(
                        format!("missing or non-numeric response `{}`", self.response),
                        bad,
                    ))
                }
            }
            Some(Column::Categorical(_)) => {
                // Report the rows that failed to parse rather than a bare type error.
                Err(AppError::data(
                    format!("response `{}` is not numeric", self.response),
                    (0..self.n_rows).collect(),
                ))
            }
            None => Err(AppError::Io(format!("response column `{}` is absent", self.response))),
        }
    }

    /// Add `log_<column>`; every source value must be present and strictly positive.
    pub fn with_log_column(mut self, column: &str) -> Result<Self, AppError> {
        let name = format!("log_{column}");
        let values = match self.column(column) {
            Some(Column::Numeric(v)) => v,
            Some(Column::Categorical(_)) => {
                return Err(AppError::data(
                    format!("cannot log-transform categorical `{column}`"),
                    Vec::new(),
                ));
            }
            None => return Err(AppError::Io(format!("column `{column}` is absent"))),
        };

        let bad: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_some_and(|x| x.is_finite() && x > 0.0))
            .map(|(i, _)| i)
            .collect();
        if !bad.is_empty() {
            return Err(AppError::data(
                format!("log transform of `{column}` requires strictly positive values"),
                bad,
            ));
        }

        let logged: Vec<Option<f64>> = values.iter().map(|v| v.map(f64::ln)).collect();
        if self.has_column(&name) {
            return Err(AppError::Io(format!("column `{name}` already exists")));
        }
        self.names.push(name.clone());
        self.columns.push(Column::Numeric(logged));
        self.derived.push((
            name,
            Derivation {
                source: column.to_string(),
                transform: Transform::Log,
            },
        ));
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// The stored spelling of `name`; exact matches win over case-insensitive ones.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|n| *n == name)
            .or_else(|| self.names.iter().find(|n| n.eq_ignore_ascii_case(name)))
            .map(String::as_str)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.columns.get(idx)
    }

    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        match self.column(name)? {
            Column::Numeric(v) => Some(v),
            Column::Categorical(_) => None,
        }
    }

    pub fn categorical(&self, name: &str) -> Option<&[Option<String>]> {
        match self.column(name)? {
            Column::Categorical(v) => Some(v),
            Column::Numeric(_) => None,
        }
    }

    /// Grouping labels; validated non-empty at construction.
    pub fn group_labels(&self) -> Vec<&str> {
        self.categorical(&self.group)
            .map(|v| v.iter().map(|l| l.as_deref().unwrap_or_default()).collect())
            .unwrap_or_default()
    }

    pub fn derivation(&self, name: &str) -> Option<&Derivation> {
        self.derived.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// Fully-present numeric values of `name`, or the rows where they are missing.
    pub fn complete_numeric(&self, name: &str) -> Result<Vec<f64>, AppError> {
        let values = self
            .numeric(name)
            .ok_or_else(|| AppError::Io(format!("numeric column `{name}` is absent")))?;
        let missing: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_some_and(f64::is_finite))
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::data(format!("missing values in `{name}`"), missing));
        }
        Ok(values.iter().map(|v| v.unwrap_or_default()).collect())
    }

    /// Hash of a numeric column's values, used to check fits share their rows.
    pub fn fingerprint(&self, name: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        self.n_rows.hash(&mut hasher);
        if let Some(values) = self.numeric(name) {
            for v in values {
                v.map(f64::to_bits).hash(&mut hasher);
            }
        }
        for label in self.group_labels() {
            label.hash(&mut hasher);
        }
        hasher.finish()
    }
}

fn into_labels(col: Column) -> Column {
    match col {
        Column::Categorical(v) => Column::Categorical(v),
        Column::Numeric(v) => Column::Categorical(
            v.into_iter()
                .map(|x| {
                    x.filter(|x| x.is_finite()).map(|x| {
                        if x.fract() == 0.0 && x.abs() < 1e15 {
                            format!("{}", x as i64)
                        } else {
                            x.to_string()
                        }
                    })
                })
                .collect(),
        ),
    }
}
