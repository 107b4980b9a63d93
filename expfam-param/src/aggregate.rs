use std::collections::BTreeMap;

use crate::distribution::ExpFamDistribution;
use crate::error::{ParamError, Result};
use crate::factor::ExpFamFactor;
use crate::param_dict::ParamDict;

/// A prior together with one factor per client, so that
/// `ν_posterior = ν_prior + Σ_i ν_i`.
#[derive(Debug)]
pub struct FactorAggregate {
    prior: ExpFamDistribution,
    factors: BTreeMap<usize, ExpFamFactor>,
}

impl FactorAggregate {
    pub fn new(prior: &ExpFamDistribution) -> Result<Self> {
        Ok(Self {
            prior: prior.non_trainable_copy()?,
            factors: BTreeMap::new(),
        })
    }

    pub fn prior(&self) -> &ExpFamDistribution {
        &self.prior
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn get(&self, id: usize) -> Result<&ExpFamFactor> {
        self.factors.get(&id).ok_or(ParamError::FactorNotFound(id))
    }

    /// Add or overwrite factor `id`, returning the previous one.
    pub fn insert(&mut self, id: usize, factor: ExpFamFactor) -> Result<Option<ExpFamFactor>> {
        self.check_factor(&factor)?;
        Ok(self.factors.insert(id, factor))
    }

    /// Swap an existing factor; fails if `id` was never added.
    pub fn replace(&mut self, id: usize, factor: ExpFamFactor) -> Result<ExpFamFactor> {
        if !self.factors.contains_key(&id) {
            return Err(ParamError::FactorNotFound(id));
        }
        self.check_factor(&factor)?;
        self.factors
            .insert(id, factor)
            .ok_or(ParamError::FactorNotFound(id))
    }

    fn check_factor(&self, factor: &ExpFamFactor) -> Result<()> {
        if factor.family() != self.prior.family() {
            return Err(ParamError::FamilyMismatch {
                left: self.prior.family(),
                right: factor.family(),
            });
        }
        self.prior.nat_params()?.check_compatible(factor.nat_params())
    }

    fn nat_sum<'a, I>(&self, factors: I) -> Result<ParamDict>
    where
        I: Iterator<Item = &'a ExpFamFactor>,
    {
        let mut nat = self.prior.nat_params()?;
        for t in factors {
            nat = nat.add(t.nat_params())?;
        }
        Ok(nat)
    }

    /// Frozen posterior `prior × Π_i t_i`.
    pub fn posterior(&self) -> Result<ExpFamDistribution> {
        let nat = self.nat_sum(self.factors.values())?;
        self.prior.with_nat_params(nat)
    }

    /// Frozen cavity `posterior / t_id`.
    pub fn cavity(&self, id: usize) -> Result<ExpFamDistribution> {
        if !self.factors.contains_key(&id) {
            return Err(ParamError::FactorNotFound(id));
        }
        let others = self
            .factors
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(_, t)| t);
        self.prior.with_nat_params(self.nat_sum(others)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Family;
    use candle_core::{Device, Tensor};

    fn prior() -> Result<ExpFamDistribution> {
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("loc", Tensor::new(&[0.0f64, 0.0], &dev)?)
            .with("scale", Tensor::new(&[1.0f64, 1.0], &dev)?);
        ExpFamDistribution::from_std(Family::MeanFieldGaussian, std, false)
    }

    fn factor(a: f64, b: f64) -> Result<ExpFamFactor> {
        let dev = Device::Cpu;
        let nat = ParamDict::new()
            .with("np1", Tensor::new(&[a, a], &dev)?)
            .with("np2", Tensor::new(&[b, b], &dev)?);
        ExpFamFactor::new(Family::MeanFieldGaussian, nat)
    }

    #[test]
    fn missing_factor_is_reported() -> Result<()> {
        let agg = FactorAggregate::new(&prior()?)?;
        assert!(matches!(agg.cavity(3), Err(ParamError::FactorNotFound(3))));
        let mut agg = agg;
        assert!(matches!(
            agg.replace(1, factor(0.0, 0.0)?),
            Err(ParamError::FactorNotFound(1))
        ));
        Ok(())
    }

    #[test]
    fn posterior_sums_factors() -> Result<()> {
        let mut agg = FactorAggregate::new(&prior()?)?;
        agg.insert(0, factor(1.0, -0.5)?)?;
        agg.insert(1, factor(2.0, -1.0)?)?;

        let post = agg.posterior()?.nat_params()?;
        let expected = prior()?
            .nat_params()?
            .add(factor(3.0, -1.5)?.nat_params())?;
        assert!(post.max_abs_diff(&expected)? < 1e-12);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_fatal() -> Result<()> {
        let mut agg = FactorAggregate::new(&prior()?)?;
        let dev = Device::Cpu;
        let nat = ParamDict::new()
            .with("np1", Tensor::new(&[0.0f64], &dev)?)
            .with("np2", Tensor::new(&[0.0f64], &dev)?);
        let bad = ExpFamFactor::new(Family::MeanFieldGaussian, nat)?;
        assert!(matches!(
            agg.insert(0, bad),
            Err(ParamError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
