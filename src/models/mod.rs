//! Model structure shared by the fitters and the predictor.
//!
//! Kept separate from fitting so that prediction can rebuild design rows for
//! a new table without depending on any fitting routine.

pub mod design;

pub use design::*;
