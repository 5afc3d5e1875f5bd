//! Numerical building blocks: least squares, dense linear algebra, scalar
//! statistics and Pareto-smoothed importance sampling.

pub mod linalg;
pub mod ols;
pub mod psis;
pub mod stats;

pub use linalg::*;
pub use ols::*;
pub use psis::*;
pub use stats::*;
