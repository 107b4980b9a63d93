//! Numerically stabilised linear algebra for symmetric positive-definite
//! matrices.
//!
//! Summing many client factors in natural-parameter space can push a
//! precision matrix towards singularity, so a plain inverse is never used:
//! we try a Cholesky factorisation, add growing jitter to the diagonal, and
//! finally fall back to an eigen-decomposition with clamped eigenvalues.

use log::warn;
use nalgebra::{Cholesky, DMatrix, Dyn, SymmetricEigen};

use crate::error::{ParamError, Result};

const MAX_JITTER_TRIES: usize = 6;
const INIT_JITTER: f64 = 1e-10;
const MIN_EIGEN_RATIO: f64 = 1e-12;

fn symmetrise(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

fn check_finite(m: &DMatrix<f64>) -> Result<()> {
    if m.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(ParamError::NonFinite("positive-definite matrix"))
    }
}

/// Cholesky factor with diagonal jitter; `None` if every attempt failed.
fn jittered_cholesky(m: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if let Some(chol) = Cholesky::new(m.clone()) {
        return Some(chol);
    }

    let scale = m.diagonal().iter().map(|x| x.abs()).sum::<f64>() / (m.nrows().max(1) as f64);
    let mut jitter = INIT_JITTER * scale.max(1.0);

    for _ in 0..MAX_JITTER_TRIES {
        let mut mm = m.clone();
        for i in 0..mm.nrows() {
            mm[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(mm) {
            warn!("added jitter {:e} to the diagonal", jitter);
            return Some(chol);
        }
        jitter *= 10.0;
    }
    None
}

/// Eigenvalues clamped from below relative to the largest one.
fn clamped_eigen(m: &DMatrix<f64>) -> SymmetricEigen<f64, Dyn> {
    let mut eig = SymmetricEigen::new(m.clone());
    let max_ev = eig.eigenvalues.iter().fold(0_f64, |a, &b| a.max(b.abs()));
    let floor = (max_ev * MIN_EIGEN_RATIO).max(f64::MIN_POSITIVE);
    let nclamped = eig.eigenvalues.iter().filter(|&&x| x < floor).count();
    if nclamped > 0 {
        warn!("clamped {} eigenvalue(s) below {:e}", nclamped, floor);
    }
    eig.eigenvalues.apply(|x| *x = x.max(floor));
    eig
}

/// Inverse of a symmetric positive-definite matrix.
pub fn psd_inverse(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    check_finite(m)?;
    let m = symmetrise(m);

    if let Some(chol) = jittered_cholesky(&m) {
        return Ok(symmetrise(&chol.inverse()));
    }

    let eig = clamped_eigen(&m);
    let inv_diag = DMatrix::from_diagonal(&eig.eigenvalues.map(|x| 1.0 / x));
    let v = &eig.eigenvectors;
    Ok(symmetrise(&(v * inv_diag * v.transpose())))
}

/// Lower-triangular `L` with `L Lᵀ ≈ m`.
pub fn psd_cholesky(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    check_finite(m)?;
    let m = symmetrise(m);

    if let Some(chol) = jittered_cholesky(&m) {
        return Ok(chol.l());
    }

    // Rebuild a positive-definite matrix from clamped eigenvalues.
    let eig = clamped_eigen(&m);
    let v = &eig.eigenvectors;
    let rebuilt = symmetrise(&(v * DMatrix::from_diagonal(&eig.eigenvalues) * v.transpose()));
    jittered_cholesky(&rebuilt)
        .map(|chol| chol.l())
        .ok_or(ParamError::NonFinite("cholesky factor"))
}

/// `ln |m|` of a symmetric positive-definite matrix.
pub fn psd_log_det(m: &DMatrix<f64>) -> Result<f64> {
    let l = psd_cholesky(m)?;
    Ok(2.0 * l.diagonal().iter().map(|x| x.abs().ln()).sum::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn inverse_of_well_conditioned_matrix() -> Result<()> {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let inv = psd_inverse(&m)?;
        let eye = &m * &inv;
        assert_abs_diff_eq!(eye[(0, 0)], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(eye[(0, 1)], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(eye[(1, 1)], 1.0, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn singular_matrix_still_inverts() -> Result<()> {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let inv = psd_inverse(&m)?;
        assert!(inv.iter().all(|x| x.is_finite()));
        Ok(())
    }

    #[test]
    fn log_det_matches_closed_form() -> Result<()> {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        assert_abs_diff_eq!(psd_log_det(&m)?, 6_f64.ln(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn nan_is_rejected() {
        let m = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(psd_inverse(&m).is_err());
    }
}
