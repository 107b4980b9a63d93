use candle_core::Tensor;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use special::Gamma as SpecialGamma;

use super::{per_sample, sample_shape, sum_event};
use crate::error::{ParamError, Result};
use crate::family::Family;
use crate::param_dict::ParamDict;
use crate::tensor_util::*;

pub const STD_KEYS: &[&str] = &["concentration1", "concentration0"];
pub const NAT_KEYS: &[&str] = &["np1", "np2"];
pub const UNC_KEYS: &[&str] = &["log_concentration1", "log_concentration0"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("np1", (std.get("concentration1")? - 1.0)?)
        .with("np2", (std.get("concentration0")? - 1.0)?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("concentration1", (nat.get("np1")? + 1.0)?)
        .with("concentration0", (nat.get("np2")? + 1.0)?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("log_concentration1", std.get("concentration1")?.log()?)
        .with("log_concentration0", std.get("concentration0")?.log()?))
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("concentration1", unc.get("log_concentration1")?.exp()?)
        .with("concentration0", unc.get("log_concentration0")?.exp()?))
}

/// `A(ν) = Σ [ln Γ(α) + ln Γ(β) - ln Γ(α + β)]`
pub fn log_a(nat: &ParamDict) -> Result<f64> {
    let np1 = to_f64_vec(nat.get("np1")?)?;
    let np2 = to_f64_vec(nat.get("np2")?)?;
    Ok(np1
        .iter()
        .zip(np2.iter())
        .map(|(a1, b1)| {
            let (a, b) = (a1 + 1.0, b1 + 1.0);
            SpecialGamma::ln_gamma(a).0 + SpecialGamma::ln_gamma(b).0
                - SpecialGamma::ln_gamma(a + b).0
        })
        .sum())
}

/// `E[ln θ] = ψ(α) - ψ(α + β)`, `E[ln(1 - θ)] = ψ(β) - ψ(α + β)`
pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    let c1 = std.get("concentration1")?;
    let a = to_f64_vec(c1)?;
    let b = to_f64_vec(std.get("concentration0")?)?;

    let (mut e1, mut e0) = (Vec::with_capacity(a.len()), Vec::with_capacity(a.len()));
    for (a, b) in a.iter().zip(b.iter()) {
        let psi_ab = (a + b).digamma();
        e1.push(a.digamma() - psi_ab);
        e0.push(b.digamma() - psi_ab);
    }

    let shape = c1.shape().clone();
    Ok(ParamDict::new()
        .with("np1", from_f64_vec(e1, shape.clone(), c1.dtype(), c1.device())?)
        .with("np2", from_f64_vec(e0, shape, c1.dtype(), c1.device())?))
}

pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    let t1 = thetas.log()?.broadcast_mul(nat.get("np1")?)?;
    let t2 = thetas.neg()?.affine(1.0, 1.0)?.log()?.broadcast_mul(nat.get("np2")?)?;
    sum_event(&(t1 + t2)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(0.0, thetas)
}

pub fn sample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
    let c1 = std.get("concentration1")?;
    let a = to_f64_vec(c1)?;
    let b = to_f64_vec(std.get("concentration0")?)?;

    let dists = a
        .iter()
        .zip(b.iter())
        .map(|(&a, &b)| Beta::new(a, b))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ParamError::Unsupported {
            family: Family::Beta,
            what: "sampling with non-positive concentrations",
        })?;

    let mut data = Vec::with_capacity(n * dists.len());
    for _ in 0..n {
        data.extend(dists.iter().map(|d| d.sample(rng)));
    }
    from_f64_vec(data, sample_shape(n, c1.dims()), c1.dtype(), c1.device())
}
