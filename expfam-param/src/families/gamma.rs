//! Gamma with shape `α` (`concentration`) and `rate` β:
//! `np1 = α - 1`, `np2 = -β`, `f(θ) = (ln θ, θ)`.

use candle_core::Tensor;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use special::Gamma as SpecialGamma;

use super::{per_sample, sample_shape, sum_event};
use crate::error::{ParamError, Result};
use crate::family::Family;
use crate::param_dict::ParamDict;
use crate::tensor_util::*;

pub const STD_KEYS: &[&str] = &["concentration", "rate"];
pub const NAT_KEYS: &[&str] = &["np1", "np2"];
pub const UNC_KEYS: &[&str] = &["log_concentration", "log_rate"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("np1", (std.get("concentration")? - 1.0)?)
        .with("np2", std.get("rate")?.neg()?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("concentration", (nat.get("np1")? + 1.0)?)
        .with("rate", nat.get("np2")?.neg()?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("log_concentration", std.get("concentration")?.log()?)
        .with("log_rate", std.get("rate")?.log()?))
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("concentration", unc.get("log_concentration")?.exp()?)
        .with("rate", unc.get("log_rate")?.exp()?))
}

/// `A(ν) = Σ [ln Γ(α) - α ln β]`
pub fn log_a(nat: &ParamDict) -> Result<f64> {
    let np1 = to_f64_vec(nat.get("np1")?)?;
    let np2 = to_f64_vec(nat.get("np2")?)?;
    Ok(np1
        .iter()
        .zip(np2.iter())
        .map(|(a1, b1)| {
            let (a, b) = (a1 + 1.0, -b1);
            SpecialGamma::ln_gamma(a).0 - a * b.ln()
        })
        .sum())
}

/// `E[ln θ] = ψ(α) - ln β`, `E[θ] = α / β`, off-graph
pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    let conc = std.get("concentration")?;
    let rate = std.get("rate")?;
    let a = to_f64_vec(conc)?;
    let b = to_f64_vec(rate)?;

    let e_log = a.iter().zip(b.iter()).map(|(a, b)| a.digamma() - b.ln()).collect();
    let e_lin = a.iter().zip(b.iter()).map(|(a, b)| a / b).collect();

    let shape = conc.shape().clone();
    Ok(ParamDict::new()
        .with("np1", from_f64_vec(e_log, shape.clone(), conc.dtype(), conc.device())?)
        .with("np2", from_f64_vec(e_lin, shape, conc.dtype(), conc.device())?))
}

pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    let t1 = thetas.log()?.broadcast_mul(nat.get("np1")?)?;
    let t2 = thetas.broadcast_mul(nat.get("np2")?)?;
    sum_event(&(t1 + t2)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(0.0, thetas)
}

pub fn sample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
    let conc = std.get("concentration")?;
    let a = to_f64_vec(conc)?;
    let b = to_f64_vec(std.get("rate")?)?;

    let dists = a
        .iter()
        .zip(b.iter())
        .map(|(&a, &b)| Gamma::new(a, 1.0 / b))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ParamError::Unsupported {
            family: Family::Gamma,
            what: "sampling with non-positive parameters",
        })?;

    let mut data = Vec::with_capacity(n * dists.len());
    for _ in 0..n {
        data.extend(dists.iter().map(|g| g.sample(rng)));
    }
    from_f64_vec(data, sample_shape(n, conc.dims()), conc.dtype(), conc.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn exponential_normaliser() -> Result<()> {
        // Gamma(1, β) is Exp(β): A = -ln β
        let dev = Device::Cpu;
        let nat = ParamDict::new()
            .with("np1", Tensor::new(&[0.0f64], &dev)?)
            .with("np2", Tensor::new(&[-3.0f64], &dev)?);
        assert_abs_diff_eq!(log_a(&nat)?, -(3_f64.ln()), epsilon = 1e-10);
        Ok(())
    }
}
