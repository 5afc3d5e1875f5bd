//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - model specifications and fixed-effect terms (`ModelSpecification`, `FixedTerm`)
//! - fitting configuration (`FitMethod`, `MlConfig`, `BayesConfig`)
//! - the immutable fitted-model handle (`FittedModel`)
//! - selection and prediction outputs (`SelectionReport`, `PredictionFrame`)

pub mod fitted;
pub mod types;

pub use fitted::*;
pub use types::*;
