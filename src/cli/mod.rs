//! Command-line parsing for the mixed-model comparison workflow.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! fitting/selection code. Arguments are converted into the typed config
//! structs in `domain` by `app`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::{Criterion, IcKind, MethodKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "mixsel", version, about = "Random-intercept model comparison and prediction")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every model in a workflow, print fit status and the ranked comparison.
    Compare(CompareArgs),
    /// Fit, select (or pick `--model`), and export predictions with intervals.
    Predict(PredictArgs),
    /// Write a synthetic grouped dataset.
    Simulate(SimulateArgs),
}

/// Criterion choices as spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CriterionArg {
    Aic,
    Aicc,
    Bic,
    Loo,
}

impl From<CriterionArg> for Criterion {
    fn from(arg: CriterionArg) -> Self {
        match arg {
            CriterionArg::Aic => Criterion::InformationCriterion(IcKind::Aic),
            CriterionArg::Aicc => Criterion::InformationCriterion(IcKind::Aicc),
            CriterionArg::Bic => Criterion::InformationCriterion(IcKind::Bic),
            CriterionArg::Loo => Criterion::LeaveOneOut,
        }
    }
}

/// Data, workflow, fitting and selection options shared by `compare` and `predict`.
#[derive(Debug, Args, Clone)]
pub struct CompareArgs {
    /// Delimited input file with a header row.
    #[arg(long, value_name = "CSV")]
    pub data: PathBuf,

    /// Workflow JSON naming the response, grouping column and candidate models.
    #[arg(long, value_name = "JSON")]
    pub workflow: PathBuf,

    /// Fitting method.
    #[arg(long, value_enum, default_value_t = MethodKind::MaximumLikelihood)]
    pub method: MethodKind,

    /// Ranking criterion. Defaults to `loo` for `--method bayes`, `aic` otherwise.
    #[arg(long, value_enum)]
    pub criterion: Option<CriterionArg>,

    /// Score differences below this are reported as indistinguishable.
    #[arg(long, default_value_t = 2.0)]
    pub threshold: f64,

    /// Seed for the Gibbs sampler.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Retained posterior draws (Bayesian only).
    #[arg(long, default_value_t = 1000)]
    pub draws: usize,

    /// Discarded warm-up iterations (Bayesian only).
    #[arg(long, default_value_t = 1000)]
    pub warmup: usize,

    /// Thinning interval (Bayesian only).
    #[arg(long, default_value_t = 1)]
    pub thin: usize,

    /// Print coefficient tables and residual summaries for every fitted model.
    #[arg(long)]
    pub details: bool,

    /// Write the selection report and model summaries to JSON.
    #[arg(long = "export-report", value_name = "JSON")]
    pub export_report: Option<PathBuf>,
}

impl CompareArgs {
    pub fn criterion(&self) -> Criterion {
        match (self.criterion, self.method) {
            (Some(c), _) => c.into(),
            (None, MethodKind::Bayesian) => Criterion::LeaveOneOut,
            (None, MethodKind::MaximumLikelihood) => Criterion::InformationCriterion(IcKind::Aic),
        }
    }
}

/// Options for `predict`.
#[derive(Debug, Args, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub compare: CompareArgs,

    /// Predict from this model instead of the selected best.
    #[arg(long)]
    pub model: Option<String>,

    /// Interval coverage.
    #[arg(long, default_value_t = 0.95)]
    pub level: f64,

    /// Include residual variance (prediction rather than confidence intervals).
    #[arg(long)]
    pub residual: bool,

    /// Point predictions only.
    #[arg(long)]
    pub no_intervals: bool,

    /// Simulation draws for the intervals.
    #[arg(long, default_value_t = 1000)]
    pub simulations: usize,

    /// Population-level predictions (omit group intercepts).
    #[arg(long)]
    pub no_group_effects: bool,

    /// Rows to print in the terminal summary.
    #[arg(long, default_value_t = 10)]
    pub head: usize,

    /// Prediction CSV.
    #[arg(long, value_name = "CSV")]
    pub export: PathBuf,
}

/// Options for `simulate`.
#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Output CSV.
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    #[arg(long, default_value_t = 200)]
    pub rows: usize,

    #[arg(long, default_value_t = 4)]
    pub groups: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Standard deviation of the group intercepts.
    #[arg(long, default_value_t = 0.5)]
    pub group_sd: f64,

    /// Residual standard deviation (log scale).
    #[arg(long, default_value_t = 0.3)]
    pub residual_sd: f64,

    /// Emit Poisson counts instead of positive continuous values.
    #[arg(long)]
    pub counts: bool,
}
