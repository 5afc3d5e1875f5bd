//! `mixsel` library crate.
//!
//! The binary (`mixsel`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the fitter, selector and predictor can be driven from other front-ends
//!
//! Typical flow: [`io::load_table`] -> [`fit::fit_all`] -> [`fit::select`] ->
//! [`predict::predict`].

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod predict;
pub mod report;
