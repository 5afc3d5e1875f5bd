//! End-to-end scenarios: load -> fit -> select -> predict.

use std::io::Write;

use approx::assert_relative_eq;
use tempfile::{NamedTempFile, tempdir};

use mixsel::app::pipeline::{run_compare, run_predict};
use mixsel::cli::{CompareArgs, PredictArgs};
use mixsel::data::{ObservationTable, SampleConfig, generate_sample};
use mixsel::domain::{
    BayesConfig, Criterion, Family, FitMethod, IcKind, MethodKind, MlConfig, ModelSpecification, PredictOptions,
    ResponseScale, SelectionConfig,
};
use mixsel::error::AppError;
use mixsel::fit::{fit, fit_all, select};
use mixsel::io::{LoadOptions, load_table, write_table_csv};
use mixsel::predict::predict;

fn log_sample() -> ObservationTable {
    generate_sample(&SampleConfig::default())
        .unwrap()
        .with_log_column("y")
        .unwrap()
}

fn specs() -> Vec<ModelSpecification> {
    vec![
        ModelSpecification::null("null", "log_y", "year"),
        ModelSpecification::null("quad", "log_y", "year")
            .linear("X")
            .quadratic("X", Some("X2")),
    ]
}

fn ml() -> FitMethod {
    FitMethod::MaximumLikelihood(MlConfig::default())
}

#[test]
fn aic_comparison_is_finite_and_reproducible() {
    let table = log_sample();
    let first: Vec<_> = fit_all(&specs(), &table, &ml()).into_iter().map(Result::unwrap).collect();
    let report = select(&first, &SelectionConfig::default()).unwrap();

    assert_eq!(report.rows.len(), 2);
    assert!(report.rows.iter().all(|r| r.score.is_finite()));
    // The generating model has strong X effects.
    assert_eq!(report.best, "quad");
    assert!(report.sole_winner);
    let quad = report.row("quad").unwrap();
    assert!(quad.delta_from_null.unwrap() < -2.0);
    assert_eq!(report.row("null").unwrap().delta_from_null, Some(0.0));

    let second: Vec<_> = fit_all(&specs(), &table, &ml()).into_iter().map(Result::unwrap).collect();
    let again = select(&second, &SelectionConfig::default()).unwrap();
    assert_eq!(again.best, report.best);
    assert_relative_eq!(again.rows[0].score, report.rows[0].score, epsilon = 1e-9);
}

#[test]
fn criteria_agree_on_a_clear_winner() {
    let table = log_sample();
    let fits: Vec<_> = fit_all(&specs(), &table, &ml()).into_iter().map(Result::unwrap).collect();
    for kind in [IcKind::Aic, IcKind::Aicc, IcKind::Bic] {
        let config = SelectionConfig {
            criterion: Criterion::InformationCriterion(kind),
            negligible_delta: 2.0,
        };
        assert_eq!(select(&fits, &config).unwrap().best, "quad");
    }
}

#[test]
fn null_model_is_always_a_valid_specification() {
    let table = log_sample();
    let null = ModelSpecification::null("null", "log_y", "year");
    assert!(null.validate(&table).is_ok());
    assert!(fit(&null, &table, &ml()).is_ok());
}

#[test]
fn poisson_residual_interval_is_unsupported() {
    let table = generate_sample(&SampleConfig {
        counts: true,
        ..SampleConfig::default()
    })
    .unwrap();
    let spec = ModelSpecification::null("counts", "y", "year")
        .with_family(Family::Poisson)
        .linear("X");
    let handle = fit(&spec, &table, &ml()).unwrap();
    assert!(handle.residual_variance().is_none());

    let opts = PredictOptions {
        include_residual_variance: true,
        ..PredictOptions::default()
    };
    assert!(matches!(predict(&handle, &table, &opts), Err(AppError::UnsupportedInterval(_))));

    let opts = PredictOptions {
        include_residual_variance: false,
        ..PredictOptions::default()
    };
    let frame = predict(&handle, &table, &opts).unwrap();
    assert_eq!(frame.scale, ResponseScale::Log);
    assert!(frame.rows.iter().all(|r| r.lower_natural.unwrap() >= 0.0));
}

#[test]
fn intervals_widen_with_level_and_stay_positive() {
    let table = log_sample();
    let handle = fit(&specs()[1], &table, &ml()).unwrap();

    let at = |level: f64| {
        let opts = PredictOptions {
            level,
            ..PredictOptions::default()
        };
        predict(&handle, &table, &opts).unwrap()
    };
    let narrow = at(0.5);
    let wide = at(0.95);
    for (n, w) in narrow.rows.iter().zip(&wide.rows) {
        assert!(w.lower.unwrap() <= n.lower.unwrap());
        assert!(w.upper.unwrap() >= n.upper.unwrap());
        assert!(w.lower_natural.unwrap() >= 0.0);
        assert_relative_eq!(n.fit_natural, n.fit.exp(), epsilon = 1e-12);
    }
}

#[test]
fn loader_feeds_the_fitter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.csv");
    write_table_csv(&path, &generate_sample(&SampleConfig::default()).unwrap()).unwrap();

    let table = load_table(&path, &LoadOptions::new("Y", "Year").with_log_response(true)).unwrap();
    assert_eq!(table.n_rows(), 200);
    let handle = fit(&specs()[1], &table, &ml()).unwrap();
    assert_relative_eq!(handle.coefficient("X").unwrap(), 0.8, epsilon = 0.15);
}

#[test]
fn gibbs_fits_rank_by_loo() {
    let table = log_sample();
    let method = FitMethod::Bayesian(BayesConfig {
        warmup: 300,
        draws: 300,
        ..BayesConfig::default()
    });
    let fits: Vec<_> = fit_all(&specs(), &table, &method).into_iter().map(Result::unwrap).collect();
    let config = SelectionConfig {
        criterion: Criterion::LeaveOneOut,
        negligible_delta: 2.0,
    };
    let report = select(&fits, &config).unwrap();
    assert_eq!(report.best, "quad");
    assert!(report.rows.iter().all(|r| r.se_delta.is_some()));

    // Information criteria need ML fits.
    assert!(matches!(
        select(&fits, &SelectionConfig::default()),
        Err(AppError::IncomparableModels(_))
    ));
}

fn write_inputs(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let data = dir.join("data.csv");
    write_table_csv(&data, &generate_sample(&SampleConfig::default()).unwrap()).unwrap();
    let workflow = dir.join("workflow.json");
    let mut f = std::fs::File::create(&workflow).unwrap();
    f.write_all(
        br#"{
            "response": "y",
            "group": "year",
            "log_response": true,
            "models": [
                {"label": "null"},
                {"label": "quad", "terms": [{"linear": "X"}, {"quadratic": {"base": "X", "column": "X2"}}]},
                {"label": "broken", "terms": [{"linear": "missing"}]}
            ]
        }"#,
    )
    .unwrap();
    (data, workflow)
}

fn compare_args(data: std::path::PathBuf, workflow: std::path::PathBuf) -> CompareArgs {
    CompareArgs {
        data,
        workflow,
        method: MethodKind::MaximumLikelihood,
        criterion: None,
        threshold: 2.0,
        seed: 7,
        draws: 1000,
        warmup: 1000,
        thin: 1,
        details: false,
        export_report: None,
    }
}

#[test]
fn pipeline_keeps_going_past_a_failed_spec() {
    let dir = tempdir().unwrap();
    let (data, workflow) = write_inputs(dir.path());
    let run = run_compare(&compare_args(data, workflow)).unwrap();

    assert_eq!(run.results.len(), 3);
    assert_eq!(run.fitted().len(), 2);
    let failed = run.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "broken");
    assert_eq!(run.report.best, "quad");
}

#[test]
fn pipeline_predicts_from_named_model() {
    let dir = tempdir().unwrap();
    let (data, workflow) = write_inputs(dir.path());
    let args = PredictArgs {
        compare: compare_args(data, workflow),
        model: Some("null".to_string()),
        level: 0.9,
        residual: true,
        no_intervals: false,
        simulations: 500,
        no_group_effects: false,
        head: 5,
        export: dir.path().join("pred.csv"),
    };
    let (_, frame) = run_predict(&args).unwrap();
    assert_eq!(frame.model, "null");
    assert_eq!(frame.len(), 200);

    let bad = PredictArgs {
        model: Some("broken".to_string()),
        ..args
    };
    assert!(matches!(run_predict(&bad), Err(AppError::InvalidConfig(_))));
}

#[test]
fn malformed_workflow_is_reported() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"not json").unwrap();
    let dir = tempdir().unwrap();
    let (data, _) = write_inputs(dir.path());
    let err = run_compare(&compare_args(data, f.path().to_path_buf())).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
