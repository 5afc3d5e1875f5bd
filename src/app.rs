//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - runs fitting + model selection
//! - prints reports
//! - writes optional exports

use clap::Parser;

use crate::cli::{Cli, Command, CompareArgs, PredictArgs, SimulateArgs};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `mixsel` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse_from(std::env::args());

    match cli.command {
        Command::Compare(args) => handle_compare(args),
        Command::Predict(args) => handle_predict(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

fn print_comparison(run: &pipeline::CompareOutput, args: &CompareArgs) {
    let status: Vec<(String, Result<_, _>)> = run
        .results
        .iter()
        .map(|(label, r)| (label.clone(), r.as_ref()))
        .collect();
    println!("{}", crate::report::format_fit_status(&status));
    println!("{}", crate::report::format_selection(&run.report));

    if args.details {
        for fit in run.fitted() {
            println!("{}", crate::report::format_fit_summary(fit));
            let diag = crate::report::residual_diagnostics(fit, 5);
            println!("{}", crate::report::format_residuals(&diag));
        }
    }
}

fn export_report(run: &pipeline::CompareOutput, args: &CompareArgs) -> Result<(), AppError> {
    if let Some(path) = &args.export_report {
        let fits: Vec<_> = run.fitted().into_iter().cloned().collect();
        crate::io::write_report_json(path, &run.report, &fits, &run.failed())?;
        log::info!("wrote report to {}", path.display());
    }
    Ok(())
}

fn handle_compare(args: CompareArgs) -> Result<(), AppError> {
    let run = pipeline::run_compare(&args)?;
    print_comparison(&run, &args);
    export_report(&run, &args)
}

fn handle_predict(args: PredictArgs) -> Result<(), AppError> {
    let (run, frame) = pipeline::run_predict(&args)?;
    print_comparison(&run, &args.compare);
    println!("{}", crate::report::format_prediction_summary(&frame, args.head));

    crate::io::write_prediction_csv(&args.export, &frame)?;
    println!("Wrote {} predictions to {}", frame.len(), args.export.display());
    export_report(&run, &args.compare)
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let config = pipeline::sample_config(&args);
    let table = crate::data::generate_sample(&config)?;
    crate::io::write_table_csv(&args.out, &table)?;
    println!(
        "Wrote {} rows in {} groups to {}",
        table.n_rows(),
        config.groups,
        args.out.display()
    );
    Ok(())
}
