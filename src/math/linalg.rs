//! Small dense linear-algebra helpers on top of nalgebra.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::AppError;

/// Cholesky factor of a symmetric positive-definite matrix.
///
/// Retries once with a tiny ridge so that numerically semi-definite
/// covariance matrices (e.g. from a singular fit) still factor.
pub fn cholesky(m: &DMatrix<f64>, what: &str) -> Result<Cholesky<f64, Dyn>, AppError> {
    if let Some(c) = m.clone().cholesky() {
        return Ok(c);
    }
    let n = m.nrows();
    let scale = (0..n).map(|i| m[(i, i)].abs()).fold(0.0, f64::max).max(1.0);
    let ridged = m + DMatrix::identity(n, n) * (scale * 1e-10);
    ridged
        .cholesky()
        .ok_or_else(|| AppError::Numerical(format!("{what} is not positive definite")))
}

/// Inverse of a symmetric positive-definite matrix.
pub fn spd_inverse(m: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>, AppError> {
    Ok(cholesky(m, what)?.inverse())
}

/// Draw from `N(mean, L Lᵀ)` given the lower Cholesky factor of the covariance.
pub fn draw_mvn<R: Rng + ?Sized>(mean: &DVector<f64>, lower: &DMatrix<f64>, rng: &mut R) -> DVector<f64> {
    let z: DVector<f64> = DVector::from_fn(mean.len(), |_, _| StandardNormal.sample(&mut *rng));
    mean + lower * z
}

/// Draw from `N(P⁻¹ b, P⁻¹)` given the Cholesky factor of the precision `P`.
///
/// Avoids forming the covariance explicitly.
pub fn draw_mvn_precision<R: Rng + ?Sized>(
    precision_chol: &Cholesky<f64, Dyn>,
    b: &DVector<f64>,
    rng: &mut R,
) -> Result<DVector<f64>, AppError> {
    let mean = precision_chol.solve(b);
    let z: DVector<f64> = DVector::from_fn(b.len(), |_, _| StandardNormal.sample(&mut *rng));
    // P = L Lᵀ  =>  Lᵀ x = z gives x ~ N(0, P⁻¹).
    let lt = precision_chol.l().transpose();
    let offset = lt
        .solve_upper_triangular(&z)
        .ok_or_else(|| AppError::Numerical("precision factor has a zero pivot".to_string()))?;
    Ok(mean + offset)
}
