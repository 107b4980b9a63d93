//! Dirichlet over a K-simplex: `np1 = α - 1`, `f(θ) = ln θ`.

use candle_core::Tensor;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use special::Gamma as SpecialGamma;

use super::{per_sample, sum_event};
use crate::error::{ParamError, Result};
use crate::family::Family;
use crate::param_dict::ParamDict;
use crate::tensor_util::*;

pub const STD_KEYS: &[&str] = &["concentration"];
pub const NAT_KEYS: &[&str] = &["np1"];
pub const UNC_KEYS: &[&str] = &["log_concentration"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("np1", (std.get("concentration")? - 1.0)?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("concentration", (nat.get("np1")? + 1.0)?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("log_concentration", std.get("concentration")?.log()?))
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("concentration", unc.get("log_concentration")?.exp()?))
}

/// `A(ν) = Σ ln Γ(α_k) - ln Γ(Σ α_k)`
pub fn log_a(nat: &ParamDict) -> Result<f64> {
    let alpha = to_f64_vec(nat.get("np1")?)?
        .into_iter()
        .map(|x| x + 1.0)
        .collect::<Vec<_>>();
    let alpha0: f64 = alpha.iter().sum();
    let lg: f64 = alpha.iter().map(|&a| SpecialGamma::ln_gamma(a).0).sum();
    Ok(lg - SpecialGamma::ln_gamma(alpha0).0)
}

/// `E[ln θ_k] = ψ(α_k) - ψ(α_0)`, off-graph
pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    let conc = std.get("concentration")?;
    let alpha0 = sum_f64(conc)?;
    let psi0 = alpha0.digamma();
    Ok(ParamDict::new().with("np1", map_f64(conc, |a| a.digamma() - psi0)?))
}

pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    sum_event(&thetas.log()?.broadcast_mul(nat.get("np1")?)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(0.0, thetas)
}

/// Normalised Gamma draws, shape (n, K)
pub fn sample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
    let conc = std.get("concentration")?;
    let alpha = to_f64_vec(conc)?;
    let k = alpha.len();

    let gammas = alpha
        .iter()
        .map(|&a| Gamma::new(a, 1.0))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ParamError::Unsupported {
            family: Family::Dirichlet,
            what: "sampling with non-positive concentration",
        })?;

    let mut data = Vec::with_capacity(n * k);
    for _ in 0..n {
        let row = gammas.iter().map(|g| g.sample(rng)).collect::<Vec<f64>>();
        let tot: f64 = row.iter().sum();
        data.extend(row.into_iter().map(|x| x / tot));
    }
    from_f64_vec(data, (n, k), conc.dtype(), conc.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn flat_dirichlet_normaliser() -> Result<()> {
        // Dir(1, 1, 1) has density 2 on the 2-simplex.
        let nat = ParamDict::new().with("np1", Tensor::zeros(3, candle_core::DType::F64, &Device::Cpu)?);
        assert_abs_diff_eq!(log_a(&nat)?, -(2_f64.ln()), epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn unconstrained_is_log_concentration() -> Result<()> {
        let dev = Device::Cpu;
        let std = ParamDict::new().with("concentration", Tensor::new(&[0.5f64, 2.0, 7.0], &dev)?);
        let unc = unc_from_std(&std)?;
        let back = std_from_unc(&unc)?;
        assert!(back.max_abs_diff(&std)? < 1e-12);
        assert_abs_diff_eq!(to_f64_vec(unc.get("log_concentration")?)?[1], 2_f64.ln(), epsilon = 1e-12);
        Ok(())
    }
}
