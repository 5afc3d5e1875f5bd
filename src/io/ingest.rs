//! Delimited-file ingest.
//!
//! Turns a CSV (or other delimited) file with a header row into a validated
//! `ObservationTable`.
//!
//! Design goals:
//! - **Strict schema** for the response and grouping columns (clear errors + exit code 2)
//! - **Row-level validation** that reports every offending row, not just the first
//! - **Deterministic typing**: a column is numeric when every present cell parses
//! - **Separation of concerns**: no fitting logic here

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use crate::data::{Column, ObservationTable};
use crate::error::AppError;

/// Cells treated as missing in addition to empty strings.
const MISSING_TOKENS: [&str; 4] = ["na", "nan", "null", "."];

/// How to read a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub response: String,
    pub group: String,
    /// Derive `log_<response>`; every response value must then be > 0.
    pub log_response: bool,
    pub delimiter: u8,
}

impl LoadOptions {
    pub fn new(response: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            group: group.into(),
            log_response: false,
            delimiter: b',',
        }
    }

    pub fn with_log_response(mut self, log_response: bool) -> Self {
        self.log_response = log_response;
        self
    }
}

/// Load a delimited file into a validated table.
pub fn load_table(path: &Path, options: &LoadOptions) -> Result<ObservationTable, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::Io(format!("Failed to open data file '{}': {e}", path.display())))?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(options.delimiter)
        .from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| AppError::Io(format!("Failed to read headers: {e}")))?
        .clone();
    let names: Vec<String> = headers.iter().map(clean_header_name).collect();
    let header_map = build_header_map(&names)?;

    let response = resolve_column(&names, &header_map, &options.response, "response")?;
    let group = resolve_column(&names, &header_map, &options.group, "grouping")?;

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];
    let mut ragged = Vec::new();
    for (row, record) in reader.records().enumerate() {
        // +2: one for the header, one for 1-based line numbers.
        let record = record.map_err(|e| AppError::Io(format!("Failed to read line {}: {e}", row + 2)))?;
        if record.len() != names.len() {
            ragged.push(row);
            continue;
        }
        for (idx, column) in cells.iter_mut().enumerate() {
            column.push(get_cell(&record, idx).map(str::to_string));
        }
    }
    if !ragged.is_empty() {
        return Err(AppError::data(
            format!("rows do not have {} fields like the header", names.len()),
            ragged,
        ));
    }

    let columns: Vec<(String, Column)> = names
        .iter()
        .zip(cells)
        .map(|(name, raw)| {
            let column = if *name == group {
                Column::Categorical(raw)
            } else {
                type_column(raw, *name == response)
            };
            (name.clone(), column)
        })
        .collect();
    let n_cols = columns.len();

    let table = if options.log_response {
        ObservationTable::from_columns_log_response(columns, &response, &group)?
    } else {
        ObservationTable::from_columns(columns, &response, &group)?
    };

    log::info!(
        "loaded {} rows x {} columns from {} (response `{response}`, group `{group}`)",
        table.n_rows(),
        n_cols,
        path.display()
    );
    Ok(table)
}

fn clean_header_name(name: &str) -> String {
    // Excel and other tools sometimes emit UTF-8 CSVs with a BOM prefix on the
    // first header. If we don't strip it, column lookups fail.
    name.trim().trim_start_matches('\u{feff}').to_string()
}

fn normalize_header_name(name: &str) -> String {
    clean_header_name(name).to_ascii_lowercase()
}

fn build_header_map(names: &[String]) -> Result<HashMap<String, usize>, AppError> {
    let mut map = HashMap::new();
    for (idx, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(AppError::Io(format!("Header {} is empty", idx + 1)));
        }
        if map.insert(normalize_header_name(name), idx).is_some() {
            return Err(AppError::Io(format!("Duplicate column `{name}` (names are case-insensitive)")));
        }
    }
    Ok(map)
}

fn resolve_column(
    names: &[String],
    header_map: &HashMap<String, usize>,
    wanted: &str,
    role: &str,
) -> Result<String, AppError> {
    header_map
        .get(&normalize_header_name(wanted))
        .map(|&idx| names[idx].clone())
        .ok_or_else(|| AppError::Io(format!("Missing required {role} column: `{wanted}`")))
}

fn get_cell(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !MISSING_TOKENS.contains(&s.to_ascii_lowercase().as_str()))
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric when every present cell parses; the response is always numeric so
/// unparsable cells surface as missing values with their row indices.
fn type_column(raw: Vec<Option<String>>, force_numeric: bool) -> Column {
    let all_numeric = raw.iter().flatten().all(|s| parse_finite(s).is_some());
    if all_numeric || force_numeric {
        Column::Numeric(raw.iter().map(|c| c.as_deref().and_then(parse_finite)).collect())
    } else {
        Column::Categorical(raw)
    }
}
