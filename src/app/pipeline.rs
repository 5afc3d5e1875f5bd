//! Shared "compare pipeline" logic used by the `compare` and `predict` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! workflow -> load table -> fit every specification -> select
//!
//! The commands can then focus on presentation and exports.

use crate::cli::{CompareArgs, PredictArgs, SimulateArgs};
use crate::data::{ObservationTable, SampleConfig};
use crate::domain::{
    BayesConfig, FitMethod, FittedModel, MethodKind, MlConfig, PredictOptions, PredictionFrame, SelectionConfig,
    SelectionReport,
};
use crate::error::AppError;
use crate::io::{Workflow, load_table, read_workflow};

/// All computed outputs of a single comparison run.
#[derive(Debug, Clone)]
pub struct CompareOutput {
    pub workflow: Workflow,
    pub table: ObservationTable,
    /// One entry per workflow model, in workflow order.
    pub results: Vec<(String, Result<FittedModel, AppError>)>,
    pub report: SelectionReport,
}

impl CompareOutput {
    /// Successfully fitted models, in workflow order.
    pub fn fitted(&self) -> Vec<&FittedModel> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect()
    }

    /// `(label, reason)` for every specification that failed.
    pub fn failed(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter_map(|(label, r)| r.as_ref().err().map(|e| (label.clone(), e.to_string())))
            .collect()
    }
}

pub fn fit_method(args: &CompareArgs) -> FitMethod {
    match args.method {
        MethodKind::MaximumLikelihood => FitMethod::MaximumLikelihood(MlConfig::default()),
        MethodKind::Bayesian => FitMethod::Bayesian(BayesConfig {
            warmup: args.warmup,
            draws: args.draws,
            thin: args.thin,
            seed: args.seed,
            ..BayesConfig::default()
        }),
    }
}

pub fn selection_config(args: &CompareArgs) -> SelectionConfig {
    SelectionConfig {
        criterion: args.criterion(),
        negligible_delta: args.threshold,
    }
}

/// Load, fit and rank every model of the workflow.
///
/// Individual fit failures are kept in `results`; the run only fails when no
/// model could be ranked.
pub fn run_compare(args: &CompareArgs) -> Result<CompareOutput, AppError> {
    let workflow = read_workflow(&args.workflow)?;
    let table = load_table(&args.data, &workflow.load_options())?;
    let specs = workflow.specifications(&table);

    let method = fit_method(args);
    let fits = crate::fit::fit_all(&specs, &table, &method);
    let results: Vec<(String, Result<FittedModel, AppError>)> =
        specs.iter().map(|s| s.label.clone()).zip(fits).collect();

    let fitted: Vec<FittedModel> = results
        .iter()
        .filter_map(|(_, r)| r.as_ref().ok().cloned())
        .collect();
    if fitted.is_empty() {
        // Surface the first failure; it is the most useful single message.
        if let Some((_, Err(e))) = results.iter().find(|(_, r)| r.is_err()) {
            return Err(e.clone());
        }
    }
    let report = crate::fit::select(&fitted, &selection_config(args))?;

    Ok(CompareOutput {
        workflow,
        table,
        results,
        report,
    })
}

pub fn predict_options(args: &PredictArgs) -> PredictOptions {
    PredictOptions {
        level: args.level,
        intervals: !args.no_intervals,
        include_residual_variance: args.residual,
        simulations: args.simulations,
        seed: args.compare.seed,
        include_group_effects: !args.no_group_effects,
    }
}

/// Run the comparison, then predict from `--model` or the selected best.
pub fn run_predict(args: &PredictArgs) -> Result<(CompareOutput, PredictionFrame), AppError> {
    let run = run_compare(&args.compare)?;
    let label = args.model.clone().unwrap_or_else(|| run.report.best.clone());

    let handle = match run.results.iter().find(|(l, _)| *l == label) {
        Some((_, Ok(h))) => h,
        Some((_, Err(e))) => {
            return Err(AppError::InvalidConfig(format!("model `{label}` was not fitted: {e}")));
        }
        None => {
            return Err(AppError::InvalidConfig(format!("workflow has no model named `{label}`")));
        }
    };
    let frame = crate::predict::predict(handle, &run.table, &predict_options(args))?;
    Ok((run, frame))
}

pub fn sample_config(args: &SimulateArgs) -> SampleConfig {
    SampleConfig {
        rows: args.rows,
        groups: args.groups,
        seed: args.seed,
        group_sd: args.group_sd,
        residual_sd: args.residual_sd,
        counts: args.counts,
        ..SampleConfig::default()
    }
}
