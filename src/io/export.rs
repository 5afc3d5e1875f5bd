//! Exports: prediction frames and tables to CSV, selection reports to JSON.
//!
//! The CSV exports are meant to be easy to consume in spreadsheets or a
//! plotting layer; the JSON report carries every fitted model's summary
//! alongside the ranking.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::ObservationTable;
use crate::domain::{ConvergenceWarning, FittedModel, MethodKind, PredictionFrame, SelectionReport};
use crate::error::AppError;

const PREDICTION_COLUMNS: [&str; 6] = ["fit", "lower", "upper", "fit_natural", "lower_natural", "upper_natural"];

fn create_writer(path: &Path, what: &str) -> Result<csv::Writer<File>, AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::Io(format!("Failed to create {what} '{}': {e}", path.display())))?;
    Ok(csv::Writer::from_writer(file))
}

fn csv_err(e: csv::Error) -> AppError {
    AppError::Io(format!("Failed to write CSV: {e}"))
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.10}")).unwrap_or_default()
}

fn table_header(table: &ObservationTable) -> Result<(), AppError> {
    if let Some(clash) = table.names().iter().find(|n| PREDICTION_COLUMNS.contains(&n.as_str())) {
        return Err(AppError::Io(format!(
            "input column `{clash}` clashes with a prediction column name"
        )));
    }
    Ok(())
}

/// Write the source rows followed by the prediction columns.
pub fn write_prediction_csv(path: &Path, frame: &PredictionFrame) -> Result<(), AppError> {
    table_header(&frame.table)?;
    let mut w = create_writer(path, "prediction CSV")?;

    let mut header: Vec<&str> = frame.table.names().iter().map(String::as_str).collect();
    header.extend(PREDICTION_COLUMNS);
    w.write_record(&header).map_err(csv_err)?;

    let columns: Vec<_> = frame
        .table
        .names()
        .iter()
        .filter_map(|n| frame.table.column(n))
        .collect();
    for (i, row) in frame.rows.iter().enumerate() {
        let mut record: Vec<String> = columns.iter().map(|c| c.cell(i)).collect();
        record.push(format!("{:.10}", row.fit));
        record.push(fmt_opt(row.lower));
        record.push(fmt_opt(row.upper));
        record.push(format!("{:.10}", row.fit_natural));
        record.push(fmt_opt(row.lower_natural));
        record.push(fmt_opt(row.upper_natural));
        w.write_record(&record).map_err(csv_err)?;
    }
    w.flush()
        .map_err(|e| AppError::Io(format!("Failed to flush prediction CSV: {e}")))?;
    Ok(())
}

/// Write a table as CSV (used for synthetic datasets).
pub fn write_table_csv(path: &Path, table: &ObservationTable) -> Result<(), AppError> {
    let mut w = create_writer(path, "data CSV")?;
    w.write_record(table.names()).map_err(csv_err)?;
    let columns: Vec<_> = table.names().iter().filter_map(|n| table.column(n)).collect();
    for i in 0..table.n_rows() {
        let record: Vec<String> = columns.iter().map(|c| c.cell(i)).collect();
        w.write_record(&record).map_err(csv_err)?;
    }
    w.flush()
        .map_err(|e| AppError::Io(format!("Failed to flush data CSV: {e}")))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CoefficientSummary {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
}

/// Serializable digest of a fitted model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub label: String,
    pub formula: String,
    pub method: MethodKind,
    pub log_likelihood: f64,
    pub n_params: usize,
    pub coefficients: Vec<CoefficientSummary>,
    pub random_variance: f64,
    pub residual_variance: Option<f64>,
    pub icc: Option<f64>,
    pub warnings: Vec<ConvergenceWarning>,
}

impl ModelSummary {
    pub fn from_fit(fit: &FittedModel) -> Self {
        let coefficients = fit
            .coefficient_names()
            .iter()
            .zip(fit.coefficients())
            .zip(fit.std_errors())
            .map(|((name, &estimate), std_error)| CoefficientSummary {
                name: name.clone(),
                estimate,
                std_error,
            })
            .collect();
        Self {
            label: fit.label().to_string(),
            formula: fit.spec().formula(),
            method: fit.method(),
            log_likelihood: fit.log_likelihood(),
            n_params: fit.n_params(),
            coefficients,
            random_variance: fit.random_variance(),
            residual_variance: fit.residual_variance(),
            icc: fit.icc(),
            warnings: fit.warnings().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportFile<'a> {
    tool: &'static str,
    generated_at: DateTime<Utc>,
    selection: &'a SelectionReport,
    models: Vec<ModelSummary>,
    /// Specifications that could not be fitted, with the reason.
    failed: &'a [(String, String)],
}

/// Write the selection report plus per-model summaries as pretty JSON.
pub fn write_report_json(
    path: &Path,
    report: &SelectionReport,
    fits: &[FittedModel],
    failed: &[(String, String)],
) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::Io(format!("Failed to create report JSON '{}': {e}", path.display())))?;
    let out = ReportFile {
        tool: "mixsel",
        generated_at: Utc::now(),
        selection: report,
        models: fits.iter().map(ModelSummary::from_fit).collect(),
        failed,
    };
    serde_json::to_writer_pretty(file, &out)
        .map_err(|e| AppError::Io(format!("Failed to write report JSON: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleConfig, generate_sample};
    use crate::domain::{FitMethod, MlConfig, ModelSpecification, PredictOptions, SelectionConfig};
    use crate::fit::{fit, select};
    use crate::io::{LoadOptions, load_table};
    use crate::predict::predict;
    use tempfile::tempdir;

    #[test]
    fn table_round_trips_through_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.csv");
        let table = generate_sample(&SampleConfig::default()).unwrap();
        write_table_csv(&path, &table).unwrap();

        let loaded = load_table(&path, &LoadOptions::new("y", "year")).unwrap();
        assert_eq!(loaded.n_rows(), table.n_rows());
        assert_eq!(loaded.group_labels(), table.group_labels());
    }

    #[test]
    fn prediction_csv_has_source_and_prediction_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pred.csv");
        let table = generate_sample(&SampleConfig::default())
            .unwrap()
            .with_log_column("y")
            .unwrap();
        let spec = ModelSpecification::null("x", "log_y", "year").linear("X");
        let h = fit(&spec, &table, &FitMethod::MaximumLikelihood(MlConfig::default())).unwrap();
        let frame = predict(&h, &table, &PredictOptions::default()).unwrap();
        write_prediction_csv(&path, &frame).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(header[..5], ["year", "X", "X2", "y", "log_y"]);
        assert_eq!(header[5..], PREDICTION_COLUMNS);
        assert_eq!(reader.records().count(), table.n_rows());
    }

    #[test]
    fn report_json_carries_timestamp_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let table = generate_sample(&SampleConfig::default())
            .unwrap()
            .with_log_column("y")
            .unwrap();
        let spec = ModelSpecification::null("null", "log_y", "year");
        let h = fit(&spec, &table, &FitMethod::MaximumLikelihood(MlConfig::default())).unwrap();
        let report = select(std::slice::from_ref(&h), &SelectionConfig::default()).unwrap();
        write_report_json(&path, &report, &[h], &[]).unwrap();

        let json: serde_json::Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert!(json["generated_at"].is_string());
        assert_eq!(json["selection"]["best"], "null");
        assert_eq!(json["models"][0]["coefficients"][0]["name"], "(Intercept)");
    }
}
