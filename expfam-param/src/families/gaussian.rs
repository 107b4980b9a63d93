//! Mean-field (diagonal) Gaussian and log-normal.
//!
//! Both share `loc`/`scale` standard parameters and
//! `np1 = loc / scale²`, `np2 = -0.5 / scale²`; the log-normal applies
//! them to `ln θ` instead of `θ`.

use candle_core::{Shape, Tensor};
use rand::Rng;

use super::{event_size, per_sample, sample_shape, sum_event, LN_2PI};
use crate::error::Result;
use crate::param_dict::ParamDict;
use crate::tensor_util::{randn_seeded, to_f64_vec};

pub const STD_KEYS: &[&str] = &["loc", "scale"];
pub const NAT_KEYS: &[&str] = &["np1", "np2"];
pub const UNC_KEYS: &[&str] = &["loc", "log_scale"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    let loc = std.get("loc")?;
    let prec = std.get("scale")?.sqr()?.recip()?;
    Ok(ParamDict::new()
        .with("np1", loc.mul(&prec)?)
        .with("np2", prec.affine(-0.5, 0.0)?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    let np1 = nat.get("np1")?;
    let np2 = nat.get("np2")?;
    Ok(ParamDict::new()
        .with("loc", np1.div(np2)?.affine(-0.5, 0.0)?)
        .with("scale", np2.recip()?.affine(-0.5, 0.0)?.sqrt()?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("loc", std.get("loc")?.clone())
        .with("log_scale", std.get("scale")?.log()?))
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new()
        .with("loc", unc.get("loc")?.clone())
        .with("scale", unc.get("log_scale")?.exp()?))
}

/// `A(ν) = Σ [-np1² / (4 np2) - ½ ln(-2 np2)]`
pub fn log_a(nat: &ParamDict) -> Result<f64> {
    let np1 = to_f64_vec(nat.get("np1")?)?;
    let np2 = to_f64_vec(nat.get("np2")?)?;
    Ok(np1
        .iter()
        .zip(np2.iter())
        .map(|(a, b)| -a * a / (4.0 * b) - 0.5 * (-2.0 * b).ln())
        .sum())
}

/// `E[θ] = loc`, `E[θ²] = loc² + scale²`, differentiable in `std`.
pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    let loc = std.get("loc")?;
    let scale = std.get("scale")?;
    Ok(ParamDict::new()
        .with("np1", loc.clone())
        .with("np2", (loc.sqr()? + scale.sqr()?)?))
}

/// `ν·f(θ)` for a batch `θ` of shape (N, ...) -> (N,)
pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    let t1 = thetas.broadcast_mul(nat.get("np1")?)?;
    let t2 = thetas.sqr()?.broadcast_mul(nat.get("np2")?)?;
    sum_event(&(t1 + t2)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(-0.5 * LN_2PI * event_size(thetas)? as f64, thetas)
}

/// `E[ln h(θ)]`, the constant in the entropy
pub fn expected_log_h(std: &ParamDict) -> Result<f64> {
    Ok(-0.5 * LN_2PI * std.get("loc")?.elem_count() as f64)
}

/// Σ KL(N(μq, σq²) ‖ N(μp, σp²)) as a scalar; gradients flow through `q`.
pub fn kl(q: &ParamDict, p: &ParamDict) -> Result<Tensor> {
    let (mq, sq) = (q.get("loc")?, q.get("scale")?);
    let (mp, sp) = (p.get("loc")?, p.get("scale")?);

    let vp = sp.sqr()?;
    let log_ratio = (sp.log()? - sq.log()?)?;
    let quad = ((sq.sqr()? + mq.sub(mp)?.sqr()?)? / vp.affine(2.0, 0.0)?)?;
    Ok(((log_ratio + quad)? - 0.5)?.sum_all()?)
}

/// Reparameterised draws `loc + scale * ε`, shape (n, loc.dims()...)
pub fn rsample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
    let loc = std.get("loc")?;
    let scale = std.get("scale")?;
    let shape = Shape::from(sample_shape(n, loc.dims()));
    let eps = randn_seeded(shape, loc.dtype(), loc.device(), rng)?;
    Ok(eps.broadcast_mul(scale)?.broadcast_add(loc)?)
}

pub mod log_normal {
    //! `θ = exp(x)`, `x ~ N(loc, scale²)`; `f(θ) = (ln θ, ln² θ)`,
    //! `h(θ) = 1 / (θ √(2π))`.

    use super::*;

    pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
        super::npf(nat, &thetas.log()?)
    }

    pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
        let log_theta = sum_event(&thetas.log()?)?;
        Ok(super::log_h(thetas)?.sub(&log_theta)?)
    }

    pub fn expected_log_h(std: &ParamDict) -> Result<f64> {
        let sum_loc: f64 = to_f64_vec(std.get("loc")?)?.iter().sum();
        Ok(super::expected_log_h(std)? - sum_loc)
    }

    pub fn rsample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
        Ok(super::rsample(std, n, rng)?.exp()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn std_dict() -> Result<ParamDict> {
        let dev = Device::Cpu;
        Ok(ParamDict::new()
            .with("loc", Tensor::new(&[0.5f64, -1.0, 2.0], &dev)?)
            .with("scale", Tensor::new(&[1.0f64, 0.3, 2.5], &dev)?))
    }

    #[test]
    fn natural_parameters_match_closed_form() -> Result<()> {
        let nat = nat_from_std(&std_dict()?)?;
        let np1 = to_f64_vec(nat.get("np1")?)?;
        let np2 = to_f64_vec(nat.get("np2")?)?;
        assert_abs_diff_eq!(np1[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(np2[1], -0.5 / 0.09, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn kl_to_itself_is_zero() -> Result<()> {
        let q = std_dict()?;
        let kl = kl(&q, &q)?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn log_normaliser_of_standard_normal() -> Result<()> {
        let dev = Device::Cpu;
        let nat = ParamDict::new()
            .with("np1", Tensor::new(&[0.0f64], &dev)?)
            .with("np2", Tensor::new(&[-0.5f64], &dev)?);
        assert_abs_diff_eq!(log_a(&nat)?, 0.0, epsilon = 1e-12);
        Ok(())
    }
}
