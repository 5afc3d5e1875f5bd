//! Observation tables and synthetic sample generation.

pub mod sample;
pub mod table;

pub use sample::*;
pub use table::*;
