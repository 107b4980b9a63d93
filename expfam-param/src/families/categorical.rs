//! Categorical and multinomial over K outcomes.
//!
//! Categorical draws are one-hot rows; multinomial draws are count rows.
//! Probabilities enter the natural parameters as `ln p`, and are recovered
//! by a softmax, so the log-probabilities need not be normalised.

use candle_core::Tensor;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use special::Gamma as SpecialGamma;

use super::{log_sum_exp, per_sample, softmax_last, sum_event};
use crate::error::{ParamError, Result};
use crate::family::Family;
use crate::param_dict::ParamDict;
use crate::tensor_util::*;

pub const STD_KEYS: &[&str] = &["probs"];
pub const NAT_KEYS: &[&str] = &["np1"];
pub const UNC_KEYS: &[&str] = &["logits"];

pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("np1", std.get("probs")?.log()?))
}

pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("probs", softmax_last(nat.get("np1")?)?))
}

pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("logits", std.get("probs")?.log()?))
}

pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("probs", softmax_last(unc.get("logits")?)?))
}

pub fn log_a(nat: &ParamDict) -> Result<f64> {
    Ok(log_sum_exp(&to_f64_vec(nat.get("np1")?)?))
}

pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
    Ok(ParamDict::new().with("np1", std.get("probs")?.clone()))
}

pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
    sum_event(&thetas.broadcast_mul(nat.get("np1")?)?)
}

pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
    per_sample(0.0, thetas)
}

fn weighted_index(probs: &Tensor, family: Family) -> Result<WeightedIndex<f64>> {
    WeightedIndex::new(to_f64_vec(probs)?).map_err(|_| ParamError::Unsupported {
        family,
        what: "sampling from invalid probabilities",
    })
}

/// One-hot draws, shape (n, K)
pub fn sample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
    let probs = std.get("probs")?;
    let k = probs.elem_count();
    let widx = weighted_index(probs, Family::Categorical)?;

    let mut data = vec![0_f64; n * k];
    for i in 0..n {
        data[i * k + widx.sample(rng)] = 1.0;
    }
    from_f64_vec(data, (n, k), probs.dtype(), probs.device())
}

pub mod multinomial {
    //! `np1` carries the (fixed) number of trials, `np2 = ln p`.

    use super::*;

    pub const STD_KEYS: &[&str] = &["total_count", "probs"];
    pub const NAT_KEYS: &[&str] = &["np1", "np2"];
    pub const UNC_KEYS: &[&str] = &["total_count", "logits"];
    /// Natural-parameter keys paired with a sufficient statistic.
    pub const STAT_KEYS: &[&str] = &["np2"];
    /// Unconstrained keys that are never optimised.
    pub const FIXED_KEYS: &[&str] = &["total_count"];

    pub fn nat_from_std(std: &ParamDict) -> Result<ParamDict> {
        Ok(ParamDict::new()
            .with("np1", std.get("total_count")?.clone())
            .with("np2", std.get("probs")?.log()?))
    }

    pub fn std_from_nat(nat: &ParamDict) -> Result<ParamDict> {
        Ok(ParamDict::new()
            .with("total_count", nat.get("np1")?.clone())
            .with("probs", softmax_last(nat.get("np2")?)?))
    }

    pub fn unc_from_std(std: &ParamDict) -> Result<ParamDict> {
        Ok(ParamDict::new()
            .with("total_count", std.get("total_count")?.clone())
            .with("logits", std.get("probs")?.log()?))
    }

    pub fn std_from_unc(unc: &ParamDict) -> Result<ParamDict> {
        Ok(ParamDict::new()
            .with("total_count", unc.get("total_count")?.clone())
            .with("probs", softmax_last(unc.get("logits")?)?))
    }

    /// `A(ν) = n · logsumexp(np2)`
    pub fn log_a(nat: &ParamDict) -> Result<f64> {
        let n = scalar_f64(nat.get("np1")?)?;
        Ok(n * log_sum_exp(&to_f64_vec(nat.get("np2")?)?))
    }

    /// `E[x] = n p`
    pub fn expected_stats(std: &ParamDict) -> Result<ParamDict> {
        let probs = std.get("probs")?;
        let n = scalar_f64(std.get("total_count")?)?;
        Ok(ParamDict::new().with("np2", probs.affine(n, 0.0)?))
    }

    pub fn npf(nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
        sum_event(&thetas.broadcast_mul(nat.get("np2")?)?)
    }

    /// `ln n! - Σ ln x_k!` per row, off-graph
    pub fn log_h(thetas: &Tensor) -> Result<Tensor> {
        let (n, k) = thetas.dims2()?;
        let counts = to_f64_vec(thetas)?;
        let ret = counts
            .chunks(k.max(1))
            .map(|row| {
                let tot: f64 = row.iter().sum();
                SpecialGamma::ln_gamma(tot + 1.0).0
                    - row
                        .iter()
                        .map(|&x| SpecialGamma::ln_gamma(x + 1.0).0)
                        .sum::<f64>()
            })
            .collect::<Vec<_>>();
        from_f64_vec(ret, n, thetas.dtype(), thetas.device())
    }

    /// Count draws, shape (n, K)
    pub fn sample<R: Rng>(std: &ParamDict, n: usize, rng: &mut R) -> Result<Tensor> {
        let probs = std.get("probs")?;
        let trials = scalar_f64(std.get("total_count")?)?.round() as usize;
        let k = probs.elem_count();
        let widx = weighted_index(probs, Family::Multinomial)?;

        let mut data = vec![0_f64; n * k];
        for i in 0..n {
            for _ in 0..trials {
                data[i * k + widx.sample(rng)] += 1.0;
            }
        }
        from_f64_vec(data, (n, k), probs.dtype(), probs.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn softmax_recovers_probabilities() -> Result<()> {
        let std = ParamDict::new().with("probs", Tensor::new(&[0.2f64, 0.3, 0.5], &Device::Cpu)?);
        let back = std_from_nat(&nat_from_std(&std)?)?;
        assert!(back.max_abs_diff(&std)? < 1e-12);
        assert_abs_diff_eq!(log_a(&nat_from_std(&std)?)?, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn multinomial_draws_sum_to_trials() -> Result<()> {
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("total_count", Tensor::new(7f64, &dev)?)
            .with("probs", Tensor::new(&[0.1f64, 0.6, 0.3], &dev)?);
        let mut rng = StdRng::seed_from_u64(3);
        let x = multinomial::sample(&std, 5, &mut rng)?;
        for row in x.to_vec2::<f64>()? {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 7.0);
        }
        Ok(())
    }
}
