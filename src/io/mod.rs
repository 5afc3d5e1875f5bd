//! Input/output helpers.
//!
//! - delimited-file ingest + validation (`ingest`)
//! - workflow JSON (`workflow`)
//! - prediction/table CSV and report JSON exports (`export`)

pub mod export;
pub mod ingest;
pub mod workflow;

pub use export::*;
pub use ingest::*;
pub use workflow::*;
