//! Model fitting and selection.
//!
//! Responsibilities:
//!
//! - prepare design data and dispatch by family and method (`fitter`)
//! - Gaussian ML (`lmm`), Poisson Laplace ML (`glmm`), Gaussian Gibbs (`bayes`)
//! - one-dimensional variance search shared by the ML fitters (`ratio_grid`)
//! - rank fitted models by information criterion or PSIS-LOO (`selection`)

pub(crate) mod bayes;
pub mod fitter;
pub(crate) mod glmm;
pub(crate) mod lmm;
pub mod ratio_grid;
pub mod selection;

pub use fitter::{fit, fit_all};
pub use ratio_grid::*;
pub use selection::*;
