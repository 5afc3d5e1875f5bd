use thiserror::Error;

/// Every failure the workflow can report.
///
/// Variants map onto process exit codes via [`AppError::exit_code`] so the
/// binary can stay a thin wrapper around the library.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    /// Bad input rows (missing/non-finite response, missing group label,
    /// non-positive value ahead of a log transform, missing covariate).
    #[error("{message} (rows: {})", fmt_rows(.rows))]
    DataValidation { message: String, rows: Vec<usize> },

    /// A model specification that cannot be fitted as written.
    #[error("invalid model specification `{label}`: {reason}")]
    InvalidSpecification { label: String, reason: String },

    /// Selection across handles fitted on different responses or rows.
    #[error("models are not comparable: {0}")]
    IncomparableModels(String),

    /// An interval was requested that the fitted model cannot provide.
    #[error("unsupported interval: {0}")]
    UnsupportedInterval(String),

    /// A family/method combination with no implementation.
    #[error("unsupported fitting method: {0}")]
    UnsupportedMethod(String),

    /// Out-of-range configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A numerical routine produced a non-finite or singular result.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Filesystem / parse failures.
    #[error("{0}")]
    Io(String),
}

impl AppError {
    pub fn data(message: impl Into<String>, rows: Vec<usize>) -> Self {
        AppError::DataValidation {
            message: message.into(),
            rows,
        }
    }

    pub fn spec(label: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::InvalidSpecification {
            label: label.into(),
            reason: reason.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Io(_) | AppError::InvalidConfig(_) => 2,
            AppError::DataValidation { .. } | AppError::InvalidSpecification { .. } => 3,
            AppError::IncomparableModels(_)
            | AppError::UnsupportedInterval(_)
            | AppError::UnsupportedMethod(_)
            | AppError::Numerical(_) => 4,
        }
    }
}

/// Keep long row lists readable in terminal output.
fn fmt_rows(rows: &[usize]) -> String {
    const SHOW: usize = 20;
    let shown: Vec<String> = rows.iter().take(SHOW).map(|r| r.to_string()).collect();
    if rows.len() > SHOW {
        format!("{} ... {} total", shown.join(", "), rows.len())
    } else {
        shown.join(", ")
    }
}
