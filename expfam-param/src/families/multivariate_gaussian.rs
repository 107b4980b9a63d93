//! Full-covariance Gaussian over a D-vector.
//!
//! Natural parameters `np1 = Σ⁻¹ μ`, `np2 = -½ Σ⁻¹`. The unconstrained form
//! keeps `loc` and a lower-triangular `scale_tril` with `Σ = L Lᵀ`.
//!
//! Conversions that need an inverse or a factorisation go through
//! `nalgebra` and are therefore off the computation graph; only
//! `std_from_unc`, `expected_stats`, `kl` and `rsample` are differentiable.

use candle_core::Tensor;
use rand::Rng;

use super::{per_sample, LN_2PI};
use crate::error::Result;
use crate::param_dict::ParamDict;
use crate::psd::{psd_cholesky, psd_inverse, psd_log_det};
use crate::tensor_util::*;

pub const STD_KEYS: &[&str] = &["loc", "covariance_matrix"];
pub const NAT_KEYS: &[&str] = &["np1", "np2"];
pub const UNC_KEYS: &[&str] = &["loc", "scale_tril"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    let loc = std.get("loc")?;
    let (dtype, dev) = (loc.dtype(), loc.device());

    let prec = psd_inverse(&to_dmatrix(std.get("covariance_matrix")?)?)?;
    let np1 = &prec * to_dvector(loc)?;
    let np2 = prec * -0.5;

    Ok(ParamDict::new()
        .with("np1", dvector_to_tensor(&np1, dtype, dev)?)
        .with("np2", dmatrix_to_tensor(&np2, dtype, dev)?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    let np1 = nat.get("np1")?;
    let (dtype, dev) = (np1.dtype(), np1.device());

    let prec = to_dmatrix(nat.get("np2")?)? * -2.0;
    let cov = psd_inverse(&prec)?;
    let loc = &cov * to_dvector(np1)?;

    Ok(ParamDict::new()
        .with("loc", dvector_to_tensor(&loc, dtype, dev)?)
        .with("covariance_matrix", dmatrix_to_tensor(&cov, dtype, dev)?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    let loc = std.get("loc")?;
    let chol = psd_cholesky(&to_dmatrix(std.get("covariance_matrix")?)?)?;
    Ok(ParamDict::new()
        .with("loc", loc.clone())
        .with("scale_tril", dmatrix_to_tensor(&chol, loc.dtype(), loc.device())?))
}

/// Lower triangle of `scale_tril`; the optimiser may move the upper part,
/// which must never reach the covariance.
pub fn masked_scale_tril(unc: &ParamDict) -> Result<Tensor> {
    let l = unc.get("scale_tril")?;
    let mask = Tensor::tril2(l.dim(0)?, l.dtype(), l.device())?;
    Ok(l.mul(&mask)?)
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    let l = masked_scale_tril(unc)?;
    let cov = l.matmul(&l.t()?)?;
    Ok(ParamDict::new()
        .with("loc", unc.get("loc")?.clone())
        .with("covariance_matrix", cov))
}

/// `A(ν) = ½ np1ᵀ Σ np1 + ½ ln|Σ|` with `Σ = (-2 np2)⁻¹`
pub fn log_a(nat: &ParamDict) -> Result<f64> {
    let np1 = to_dvector(nat.get("np1")?)?;
    let prec = to_dmatrix(nat.get("np2")?)? * -2.0;
    let cov = psd_inverse(&prec)?;
    let quad = np1.dot(&(&cov * &np1));
    Ok(0.5 * quad - 0.5 * psd_log_det(&prec)?)
}

/// `E[θ] = μ`, `E[θθᵀ] = Σ + μμᵀ`
pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    let loc = std.get("loc")?;
    let outer = loc.unsqueeze(1)?.matmul(&loc.unsqueeze(0)?)?;
    Ok(ParamDict::new()
        .with("np1", loc.clone())
        .with("np2", (std.get("covariance_matrix")? + outer)?))
}

/// `θᵀ np1 + θᵀ np2 θ` for θ of shape (N, D)
pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    let np1 = nat.get("np1")?;
    let np2 = nat.get("np2")?;
    let lin = thetas.matmul(&np1.unsqueeze(1)?)?.squeeze(1)?;
    let quad = thetas.matmul(np2)?.mul(thetas)?.sum(1)?;
    Ok((lin + quad)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(-0.5 * LN_2PI * thetas.dim(1)? as f64, thetas)
}

pub fn expected_log_h(std: &ParamDict) -> Result<f64> {
    Ok(-0.5 * LN_2PI * std.get("loc")?.elem_count() as f64)
}

/// Reference distribution of a KL divergence, held as constants.
pub struct KlTarget {
    pub loc: Tensor,
    pub precision: Tensor,
    pub log_det_cov: f64,
}

impl KlTarget {
    pub fn from_std(std: &ParamDict) -> Result<Self> {
        let loc = std.get("loc")?.detach();
        let cov = to_dmatrix(std.get("covariance_matrix")?)?;
        let prec = psd_inverse(&cov)?;
        Ok(Self {
            precision: dmatrix_to_tensor(&prec, loc.dtype(), loc.device())?,
            log_det_cov: psd_log_det(&cov)?,
            loc,
        })
    }
}

/// KL(q ‖ p) = ½ [tr(Σp⁻¹ Σq) + (μp - μq)ᵀ Σp⁻¹ (μp - μq) - D + ln|Σp| - ln|Σq|]
///
/// * `q` - standard parameters (may carry gradients)
/// * `q_log_det` - scalar `ln|Σq|` (may carry gradients)
/// * `p` - constant target
pub fn kl(q: &ParamDict, q_log_det: &Tensor, p: &KlTarget) -> Result<Tensor> {
    let loc = q.get("loc")?;
    let cov = q.get("covariance_matrix")?;
    let d = loc.dim(0)? as f64;

    let trace = p.precision.mul(cov)?.sum_all()?;
    let diff = p.loc.sub(loc)?;
    let maha = diff
        .unsqueeze(0)?
        .matmul(&p.precision)?
        .squeeze(0)?
        .mul(&diff)?
        .sum_all()?;

    let inner = ((trace + maha)? - q_log_det)?;
    Ok(inner.affine(0.5, 0.5 * (p.log_det_cov - d))?)
}

/// `ln|L Lᵀ| = 2 Σ ln|L_ii|`, differentiable in `scale_tril`.
pub fn log_det_from_tril(l: &Tensor) -> Result<Tensor> {
    let eye = Tensor::eye(l.dim(0)?, l.dtype(), l.device())?;
    let diag = l.mul(&eye)?.sum(1)?;
    Ok(diag.abs()?.log()?.sum_all()?.affine(2.0, 0.0)?)
}

/// Reparameterised draws `μ + L ε`, shape (n, D)
pub fn rsample<R: Rng>(loc: &Tensor, scale_tril: &Tensor, n: usize, rng: &mut R) -> Result<Tensor> {
    let d = loc.dim(0)?;
    let eps = randn_seeded((n, d), loc.dtype(), loc.device(), rng)?;
    Ok(eps.matmul(&scale_tril.t()?)?.broadcast_add(loc)?)
}

/// Constant Cholesky factor of a frozen covariance.
pub fn cholesky_tensor(std: &ParamDict) -> Result<Tensor> {
    let cov = std.get("covariance_matrix")?;
    let chol = psd_cholesky(&to_dmatrix(cov)?)?;
    dmatrix_to_tensor(&chol, cov.dtype(), cov.device())
}

pub fn log_det_tensor(std: &ParamDict) -> Result<Tensor> {
    let cov = std.get("covariance_matrix")?;
    let ld = psd_log_det(&to_dmatrix(cov)?)?;
    Ok(Tensor::new(ld, cov.device())?.to_dtype(cov.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn std_dict() -> Result<ParamDict> {
        let dev = Device::Cpu;
        Ok(ParamDict::new()
            .with("loc", Tensor::new(&[1.0f64, -2.0], &dev)?)
            .with(
                "covariance_matrix",
                Tensor::new(&[[2.0f64, 0.5], [0.5, 1.0]], &dev)?,
            ))
    }

    #[test]
    fn natural_round_trip() -> Result<()> {
        let std = std_dict()?;
        let back = std_from_nat(&nat_from_std(&std)?)?;
        assert!(back.max_abs_diff(&std)? < 1e-10);
        Ok(())
    }

    #[test]
    fn unconstrained_round_trip() -> Result<()> {
        let std = std_dict()?;
        let back = std_from_unc(&unc_from_std(&std)?)?;
        assert!(back.max_abs_diff(&std)? < 1e-10);
        Ok(())
    }

    #[test]
    fn kl_to_itself_is_zero() -> Result<()> {
        let std = std_dict()?;
        let target = KlTarget::from_std(&std)?;
        let kl = kl(&std, &log_det_tensor(&std)?, &target)?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-10);
        Ok(())
    }
}
