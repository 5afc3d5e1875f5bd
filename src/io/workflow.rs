//! Workflow JSON files.
//!
//! A workflow names the response and grouping columns once and lists the
//! candidate models as structured terms:
//!
//! ```json
//! {
//!   "response": "y",
//!   "group": "year",
//!   "log_response": true,
//!   "models": [
//!     { "label": "null", "terms": [] },
//!     { "label": "quad", "terms": [{"linear": "X"}, {"quadratic": {"base": "X", "column": "X2"}}] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::ObservationTable;
use crate::domain::{Family, FixedTerm, ModelSpecification};
use crate::error::AppError;
use crate::io::ingest::LoadOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowModel {
    pub label: String,
    #[serde(default)]
    pub terms: Vec<FixedTerm>,
    /// Overrides the workflow-wide family.
    #[serde(default)]
    pub family: Option<Family>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub response: String,
    pub group: String,
    #[serde(default)]
    pub log_response: bool,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub delimiter: Option<char>,
    pub models: Vec<WorkflowModel>,
}

impl Workflow {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.models.is_empty() {
            return Err(AppError::InvalidConfig("workflow lists no models".to_string()));
        }
        let mut seen = HashSet::new();
        for m in &self.models {
            if m.label.trim().is_empty() {
                return Err(AppError::InvalidConfig("workflow model with an empty label".to_string()));
            }
            if !seen.insert(m.label.as_str()) {
                return Err(AppError::InvalidConfig(format!("duplicate model label `{}`", m.label)));
            }
        }
        if let Some(d) = self.delimiter {
            if !d.is_ascii() {
                return Err(AppError::InvalidConfig(format!("delimiter `{d}` is not a single ASCII character")));
            }
        }
        if !self.models.iter().any(|m| m.terms.is_empty()) {
            log::warn!("workflow has no null (grouping-only) model; deltas from null will be omitted");
        }
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            response: self.response.clone(),
            group: self.group.clone(),
            log_response: self.log_response,
            delimiter: self.delimiter.map(|d| d as u8).unwrap_or(b','),
        }
    }

    /// Specifications against a loaded table, with column names resolved to
    /// the table's spelling.
    ///
    /// Gaussian models use `log_<response>` when the workflow asks for a log
    /// transform; Poisson models always use the raw counts.
    pub fn specifications(&self, table: &ObservationTable) -> Vec<ModelSpecification> {
        let resolve = |name: &str| table.canonical_name(name).unwrap_or(name).to_string();
        let raw_response = table.response().to_string();
        let group = table.group().to_string();

        self.models
            .iter()
            .map(|m| {
                let family = m.family.unwrap_or(self.family);
                let response = match family {
                    Family::Gaussian if self.log_response => format!("log_{raw_response}"),
                    _ => raw_response.clone(),
                };
                let terms = m
                    .terms
                    .iter()
                    .map(|t| match t {
                        FixedTerm::Linear(c) => FixedTerm::Linear(resolve(c)),
                        FixedTerm::Quadratic { base, column } => FixedTerm::Quadratic {
                            base: resolve(base),
                            column: column.as_deref().map(resolve),
                        },
                    })
                    .collect();
                ModelSpecification {
                    label: m.label.clone(),
                    response,
                    family,
                    terms,
                    group: group.clone(),
                }
            })
            .collect()
    }
}

/// Read and validate a workflow JSON file.
pub fn read_workflow(path: &Path) -> Result<Workflow, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::Io(format!("Failed to open workflow '{}': {e}", path.display())))?;
    let workflow: Workflow =
        serde_json::from_reader(file).map_err(|e| AppError::Io(format!("Invalid workflow JSON: {e}")))?;
    workflow.validate()?;
    Ok(workflow)
}
