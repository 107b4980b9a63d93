use candle_core::Tensor;

use crate::distribution::{inner_product_tensor, ExpFamDistribution};
use crate::error::{ParamError, Result};
use crate::family::{check_keys, Family};
use crate::param_dict::ParamDict;

/// A client's pseudo-likelihood term `t(θ) ∝ h(θ) exp(ν·f(θ))`, held
/// only as natural parameters with the key set of the posterior it
/// multiplies.
#[derive(Debug, Clone)]
pub struct ExpFamFactor {
    family: Family,
    nat_params: ParamDict,
    inducing_locations: Option<Tensor>,
}

impl ExpFamFactor {
    pub fn new(family: Family, nat_params: ParamDict) -> Result<Self> {
        check_keys(family, &nat_params, family.nat_keys())?;
        Ok(Self {
            family,
            nat_params: nat_params.detach(),
            inducing_locations: None,
        })
    }

    /// The uninformative factor for `q`: zero natural parameters of the
    /// same keys and shapes, sharing `q`'s reference locations.
    pub fn zero_like(q: &ExpFamDistribution) -> Result<Self> {
        let nat = q.nat_params()?.detach().zeros_like()?;
        let mut ret = Self::new(q.family(), nat)?;
        ret.inducing_locations = q.inducing_locations().cloned();
        Ok(ret)
    }

    pub fn with_inducing_locations(mut self, z: Tensor) -> Self {
        self.inducing_locations = Some(z.detach());
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn nat_params(&self) -> &ParamDict {
        &self.nat_params
    }

    pub fn inducing_locations(&self) -> Option<&Tensor> {
        self.inducing_locations.as_ref()
    }

    fn check_family(&self, q: &ExpFamDistribution) -> Result<()> {
        if q.family() != self.family {
            return Err(ParamError::FamilyMismatch {
                left: self.family,
                right: q.family(),
            });
        }
        Ok(())
    }

    /// `t_new = q_new / q_old · t_old`, i.e. for every key
    /// `ν_t_new = ν_q_new - ν_q_old + ν_t_old`. All operands are detached.
    pub fn compute_refined_factor(
        &self,
        q_new: &ExpFamDistribution,
        q_old: &ExpFamDistribution,
    ) -> Result<Self> {
        self.check_family(q_new)?;
        self.check_family(q_old)?;

        let nat_new = q_new.nat_params()?.detach();
        let nat_old = q_old.nat_params()?.detach();
        let nat = nat_new.sub(&nat_old)?.add(&self.nat_params)?;

        Ok(Self {
            family: self.family,
            nat_params: nat,
            inducing_locations: q_new
                .inducing_locations()
                .map(|z| z.detach())
                .or_else(|| self.inducing_locations.clone()),
        })
    }

    /// `ln t(θ) = ln h(θ) + ν·f(θ)` (unnormalised) for each row of `thetas`.
    pub fn log_t(&self, thetas: &Tensor) -> Result<Tensor> {
        let lh = self.family.log_h(thetas)?;
        Ok((lh + self.family.npf(&self.nat_params, thetas)?)?)
    }

    /// `E_q[ν·f(θ)]` as a scalar tensor, differentiable in `q` for the
    /// Gaussian families.
    pub fn eq_log_t(&self, q: &ExpFamDistribution) -> Result<Tensor> {
        self.check_family(q)?;
        inner_product_tensor(&self.nat_params, &q.expected_stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    use crate::tensor_util::{scalar_f64, to_f64_vec};

    fn mfg(loc: &[f64], scale: &[f64]) -> Result<ExpFamDistribution> {
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("loc", Tensor::new(loc, &dev)?)
            .with("scale", Tensor::new(scale, &dev)?);
        ExpFamDistribution::from_std(Family::MeanFieldGaussian, std, false)
    }

    #[test]
    fn refined_factor_is_natural_difference() -> Result<()> {
        let q_old = mfg(&[0.0, 0.0], &[1.0, 1.0])?;
        let q_new = mfg(&[1.0, -1.0], &[0.5, 0.5])?;
        let t = ExpFamFactor::zero_like(&q_old)?;

        let t_new = t.compute_refined_factor(&q_new, &q_old)?;
        let expected = q_new.nat_params()?.sub(&q_old.nat_params()?)?;
        assert!(t_new.nat_params().max_abs_diff(&expected)? < 1e-12);
        Ok(())
    }

    #[test]
    fn refined_factor_is_detached_from_trainable_q() -> Result<()> {
        let q_old = mfg(&[0.0], &[1.0])?;
        let q_new = q_old.trainable_copy()?;
        let t_new = ExpFamFactor::zero_like(&q_old)?.compute_refined_factor(&q_new, &q_old)?;
        for (_, v) in t_new.nat_params().iter() {
            assert!(!v.track_op());
        }
        Ok(())
    }

    #[test]
    fn zero_factor_has_zero_expected_log() -> Result<()> {
        let q = mfg(&[1.0, 2.0], &[1.0, 3.0])?;
        let t = ExpFamFactor::zero_like(&q)?;
        assert_abs_diff_eq!(scalar_f64(&t.eq_log_t(&q)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn log_t_of_gaussian_factor() -> Result<()> {
        // ν = (μ/σ², -1/(2σ²)) with μ = 1, σ = 1
        let dev = Device::Cpu;
        let nat = ParamDict::new()
            .with("np1", Tensor::new(&[1.0f64], &dev)?)
            .with("np2", Tensor::new(&[-0.5f64], &dev)?);
        let t = ExpFamFactor::new(Family::MeanFieldGaussian, nat)?;
        let lt = t.log_t(&Tensor::new(&[[2.0f64]], &dev)?)?;
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() + 2.0 - 2.0;
        assert_abs_diff_eq!(to_f64_vec(&lt)?[0], expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn family_mismatch_is_rejected() -> Result<()> {
        let q = mfg(&[0.0], &[1.0])?;
        let nat = ParamDict::new().with("np1", Tensor::new(&[0.0f64, 0.0], &Device::Cpu)?);
        let t = ExpFamFactor::new(Family::Dirichlet, nat)?;
        assert!(matches!(
            t.eq_log_t(&q),
            Err(ParamError::FamilyMismatch { .. })
        ));
        Ok(())
    }
}
