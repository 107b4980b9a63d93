use std::cell::OnceCell;
use std::collections::BTreeMap;

use candle_core::{Tensor, Var};
use rand::Rng;

use crate::error::{ParamError, Result};
use crate::families::{categorical::multinomial, gaussian, multivariate_gaussian as mvn};
use crate::family::{check_keys, Family, Representation};
use crate::param_dict::ParamDict;
use crate::tensor_util::*;

/// A member of an exponential family,
/// `p(θ) = h(θ) exp(ν·f(θ) - A(ν))`.
///
/// A distribution is either *trainable* (the unconstrained parameters are
/// `Var`s and the only authoritative representation; everything else is
/// recomputed on the graph) or *frozen* (standard or natural parameters
/// are authoritative, the other one is derived once and memoised).
/// Copies never alias: every copy holds detached values.
#[derive(Debug)]
pub struct ExpFamDistribution {
    family: Family,
    params: Params,
    inducing_locations: Option<Tensor>,
}

#[derive(Debug)]
enum Params {
    Trainable {
        vars: BTreeMap<String, Var>,
        fixed: ParamDict,
    },
    Frozen(FrozenParams),
}

/// Memo for a frozen distribution. The authoritative cell is always set;
/// an empty cell means "not derived yet".
#[derive(Debug)]
struct FrozenParams {
    authoritative: Representation,
    std: OnceCell<ParamDict>,
    nat: OnceCell<ParamDict>,
}

impl FrozenParams {
    fn standard(std: ParamDict) -> Self {
        Self {
            authoritative: Representation::Standard,
            std: OnceCell::from(std),
            nat: OnceCell::new(),
        }
    }

    fn natural(nat: ParamDict) -> Self {
        Self {
            authoritative: Representation::Natural,
            std: OnceCell::new(),
            nat: OnceCell::from(nat),
        }
    }
}

fn memoised<F>(cell: &OnceCell<ParamDict>, derive: F) -> Result<ParamDict>
where
    F: FnOnce() -> Result<ParamDict>,
{
    if let Some(v) = cell.get() {
        return Ok(v.clone());
    }
    let v = derive()?;
    let _ = cell.set(v.clone());
    Ok(v)
}

impl ExpFamDistribution {
    /// Build from standard parameters.
    pub fn from_std(family: Family, std: ParamDict, trainable: bool) -> Result<Self> {
        check_keys(family, &std, family.std_keys())?;
        let std = std.detach();
        if trainable {
            Self::from_unc(family, family.unc_from_std(&std)?)
        } else {
            Ok(Self::frozen(family, FrozenParams::standard(std)))
        }
    }

    /// Build from natural parameters. A trainable distribution converts
    /// once to standard and then to unconstrained parameters.
    pub fn from_nat(family: Family, nat: ParamDict, trainable: bool) -> Result<Self> {
        check_keys(family, &nat, family.nat_keys())?;
        let nat = nat.detach();
        if trainable {
            Self::from_unc(family, family.unc_from_std(&family.std_from_nat(&nat)?)?)
        } else {
            Ok(Self::frozen(family, FrozenParams::natural(nat)))
        }
    }

    /// Build a trainable distribution; every non-fixed unconstrained
    /// parameter becomes a fresh `Var`.
    pub fn from_unc(family: Family, unc: ParamDict) -> Result<Self> {
        check_keys(family, &unc, family.unc_keys())?;
        let fixed_keys = family.fixed_unc_keys();

        let mut vars = BTreeMap::new();
        let mut fixed = ParamDict::new();
        for (k, v) in unc.iter() {
            if fixed_keys.contains(&k.as_str()) {
                fixed.insert(k, v.detach());
            } else {
                vars.insert(k.clone(), Var::from_tensor(&v.detach())?);
            }
        }

        Ok(Self {
            family,
            params: Params::Trainable { vars, fixed },
            inducing_locations: None,
        })
    }

    fn frozen(family: Family, params: FrozenParams) -> Self {
        Self {
            family,
            params: Params::Frozen(params),
            inducing_locations: None,
        }
    }

    /// Attach shared reference (inducing) locations.
    pub fn with_inducing_locations(mut self, z: Tensor) -> Self {
        self.inducing_locations = Some(z.detach());
        self
    }

    pub fn inducing_locations(&self) -> Option<&Tensor> {
        self.inducing_locations.as_ref()
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self.params, Params::Trainable { .. })
    }

    pub fn authoritative(&self) -> Representation {
        match &self.params {
            Params::Trainable { .. } => Representation::Unconstrained,
            Params::Frozen(p) => p.authoritative,
        }
    }

    /// Whether `repr` is currently held without recomputation.
    pub fn is_cached(&self, repr: Representation) -> bool {
        match (&self.params, repr) {
            (Params::Trainable { .. }, Representation::Unconstrained) => true,
            (Params::Trainable { .. }, _) => false,
            (Params::Frozen(p), Representation::Standard) => p.std.get().is_some(),
            (Params::Frozen(p), Representation::Natural) => p.nat.get().is_some(),
            (Params::Frozen(_), Representation::Unconstrained) => false,
        }
    }

    /// Optimisable leaves; empty for a frozen distribution.
    pub fn parameters(&self) -> Vec<Var> {
        match &self.params {
            Params::Trainable { vars, .. } => vars.values().cloned().collect(),
            Params::Frozen(_) => vec![],
        }
    }

    pub fn unc_params(&self) -> Result<ParamDict> {
        match &self.params {
            Params::Trainable { vars, fixed } => {
                let mut ret = fixed.clone();
                for (k, v) in vars.iter() {
                    ret.insert(k, v.as_tensor().clone());
                }
                Ok(ret)
            }
            Params::Frozen(_) => self.family.unc_from_std(&self.std_params()?),
        }
    }

    pub fn std_params(&self) -> Result<ParamDict> {
        match &self.params {
            Params::Trainable { .. } => self.family.std_from_unc(&self.unc_params()?),
            Params::Frozen(p) => memoised(&p.std, || {
                let nat = p.nat.get().ok_or(ParamError::NonFinite("empty parameter cache"))?;
                self.family.std_from_nat(nat)
            }),
        }
    }

    pub fn nat_params(&self) -> Result<ParamDict> {
        match &self.params {
            Params::Trainable { .. } => self.family.nat_from_std(&self.std_params()?),
            Params::Frozen(p) => memoised(&p.nat, || {
                let std = p.std.get().ok_or(ParamError::NonFinite("empty parameter cache"))?;
                self.family.nat_from_std(std)
            }),
        }
    }

    /// Replace the standard parameters, dropping every derived value.
    pub fn set_std_params(&mut self, std: ParamDict) -> Result<()> {
        check_keys(self.family, &std, self.family.std_keys())?;
        let std = std.detach();
        if self.is_trainable() {
            let unc = self.family.unc_from_std(&std)?;
            return self.assign_unc(&unc);
        }
        self.params = Params::Frozen(FrozenParams::standard(std));
        Ok(())
    }

    /// Replace the natural parameters, dropping every derived value.
    pub fn set_nat_params(&mut self, nat: ParamDict) -> Result<()> {
        check_keys(self.family, &nat, self.family.nat_keys())?;
        let nat = nat.detach();
        if self.is_trainable() {
            let unc = self.family.unc_from_std(&self.family.std_from_nat(&nat)?)?;
            return self.assign_unc(&unc);
        }
        self.params = Params::Frozen(FrozenParams::natural(nat));
        Ok(())
    }

    /// Overwrite `Var` values in place so optimisers keep their handles.
    fn assign_unc(&mut self, unc: &ParamDict) -> Result<()> {
        if let Params::Trainable { vars, fixed } = &mut self.params {
            for (k, v) in vars.iter() {
                v.set(unc.get(k)?)?;
            }
            for k in fixed.keys() {
                fixed.insert(&k, unc.get(&k)?.detach());
            }
        }
        Ok(())
    }

    /// A frozen distribution of the same family built from `nat`.
    pub fn with_nat_params(&self, nat: ParamDict) -> Result<Self> {
        let ret = Self::from_nat(self.family, nat, false)?;
        Ok(match &self.inducing_locations {
            Some(z) => ret.with_inducing_locations(z.clone()),
            None => ret,
        })
    }

    /// Frozen copy with detached values. Reuses whatever is already held:
    /// a trainable source is read from its unconstrained parameters.
    pub fn non_trainable_copy(&self) -> Result<Self> {
        let params = match &self.params {
            Params::Trainable { .. } => FrozenParams::standard(self.std_params()?.detach()),
            Params::Frozen(p) => {
                let copy = FrozenParams {
                    authoritative: p.authoritative,
                    std: OnceCell::new(),
                    nat: OnceCell::new(),
                };
                if let Some(std) = p.std.get() {
                    let _ = copy.std.set(std.detach());
                }
                if let Some(nat) = p.nat.get() {
                    let _ = copy.nat.set(nat.detach());
                }
                copy
            }
        };
        Ok(self.copy_locations(Self::frozen(self.family, params)))
    }

    /// Trainable copy with fresh `Var`s. Standard parameters are derived
    /// from natural ones only if nothing closer is held.
    pub fn trainable_copy(&self) -> Result<Self> {
        let unc = match &self.params {
            Params::Trainable { .. } => self.unc_params()?,
            Params::Frozen(p) => match p.std.get() {
                Some(std) => self.family.unc_from_std(std)?,
                None => self.family.unc_from_std(&self.std_params()?)?,
            },
        };
        Ok(self.copy_locations(Self::from_unc(self.family, unc.detach())?))
    }

    fn copy_locations(&self, mut other: Self) -> Self {
        other.inducing_locations = self.inducing_locations.as_ref().map(|z| z.detach());
        other
    }

    /// Expected sufficient statistics under this distribution, keyed by
    /// natural-parameter key; carries gradients for Gaussian families.
    pub fn expected_stats(&self) -> Result<ParamDict> {
        self.family.expected_stats(&self.std_params()?)
    }

    /// Draws without gradients, shape (n, event...)
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Tensor> {
        use crate::families::*;

        if self.family.is_reparameterisable() {
            return Ok(self.rsample(n, rng)?.detach());
        }

        let std = self.std_params()?.detach();
        match self.family {
            Family::Dirichlet => dirichlet::sample(&std, n, rng),
            Family::Categorical => categorical::sample(&std, n, rng),
            Family::Multinomial => multinomial::sample(&std, n, rng),
            Family::Gamma => gamma::sample(&std, n, rng),
            Family::Beta => beta::sample(&std, n, rng),
            family => Err(ParamError::Unsupported {
                family,
                what: "non-reparameterised sampling",
            }),
        }
    }

    /// Reparameterised draws; gradients flow to the trainable parameters.
    pub fn rsample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Tensor> {
        match self.family {
            Family::MeanFieldGaussian => gaussian::rsample(&self.std_params()?, n, rng),
            Family::LogNormal => gaussian::log_normal::rsample(&self.std_params()?, n, rng),
            Family::MultivariateGaussian => {
                let std = self.std_params()?;
                let tril = self.scale_tril(&std)?;
                mvn::rsample(std.get("loc")?, &tril, n, rng)
            }
            family => Err(ParamError::Unsupported {
                family,
                what: "reparameterised sampling",
            }),
        }
    }

    fn scale_tril(&self, std: &ParamDict) -> Result<Tensor> {
        match &self.params {
            Params::Trainable { .. } => mvn::masked_scale_tril(&self.unc_params()?),
            Params::Frozen(_) => mvn::cholesky_tensor(std),
        }
    }

    /// `ln p(θ)` for each row of `thetas`. The normaliser is evaluated
    /// off-graph.
    pub fn log_prob(&self, thetas: &Tensor) -> Result<Tensor> {
        let nat = self.nat_params()?;
        let log_a = self.family.log_a(&nat.detach())?;
        let lp = (self.family.log_h(thetas)? + self.family.npf(&nat, thetas)?)?;
        Ok((lp - log_a)?)
    }

    /// KL(self ‖ other) summed over all dimensions, as a scalar tensor.
    /// `other` is treated as a constant; gradients flow through `self` for
    /// the Gaussian families.
    pub fn kl_divergence(&self, other: &ExpFamDistribution) -> Result<Tensor> {
        if self.family != other.family {
            return Err(ParamError::FamilyMismatch {
                left: self.family,
                right: other.family,
            });
        }

        match self.family {
            Family::MeanFieldGaussian | Family::LogNormal => {
                gaussian::kl(&self.std_params()?, &other.std_params()?.detach())
            }
            Family::MultivariateGaussian => {
                let std = self.std_params()?;
                let log_det = match &self.params {
                    Params::Trainable { .. } => {
                        mvn::log_det_from_tril(&mvn::masked_scale_tril(&self.unc_params()?)?)?
                    }
                    Params::Frozen(_) => mvn::log_det_tensor(&std)?,
                };
                let target = mvn::KlTarget::from_std(&other.std_params()?)?;
                mvn::kl(&std, &log_det, &target)
            }
            _ => self.exp_fam_kl(other),
        }
    }

    /// `KL(q ‖ p) = (ν_q - ν_p)·E_q[f] - A(ν_q) + A(ν_p)`, off-graph.
    fn exp_fam_kl(&self, other: &ExpFamDistribution) -> Result<Tensor> {
        let nat_q = self.nat_params()?.detach();
        let nat_p = other.nat_params()?.detach();

        if self.family == Family::Multinomial {
            let (nq, np) = (scalar_f64(nat_q.get("np1")?)?, scalar_f64(nat_p.get("np1")?)?);
            if (nq - np).abs() > 0.0 {
                return Err(ParamError::Unsupported {
                    family: self.family,
                    what: "KL divergence between different trial counts",
                });
            }
        }

        let stats = self.family.mean_params(&nat_q)?;
        let dot = inner_product(&nat_q.sub(&nat_p)?, &stats)?;
        let kl = dot - self.family.log_a(&nat_q)? + self.family.log_a(&nat_p)?;

        let like = nat_q.get(self.family.nat_keys()[0])?;
        Ok(Tensor::new(kl, like.device())?.to_dtype(like.dtype())?)
    }

    /// Entropy `A(ν) - ν·E[f] - E[ln h]`, where closed-form.
    pub fn entropy(&self) -> Result<f64> {
        let nat = self.nat_params()?.detach();
        let std = self.std_params()?.detach();
        let stats = self.family.expected_stats(&std)?;
        Ok(self.family.log_a(&nat)? - inner_product(&nat, &stats)? - self.family.expected_log_h(&std)?)
    }
}

/// `Σ_k ⟨ν_k, s_k⟩` over the keys of `stats`, as an `f64`.
pub(crate) fn inner_product(nat: &ParamDict, stats: &ParamDict) -> Result<f64> {
    sum_f64(&inner_product_tensor(nat, stats)?)
}

/// `Σ_k ⟨ν_k, s_k⟩` over the keys of `stats`, kept on the graph.
pub(crate) fn inner_product_tensor(nat: &ParamDict, stats: &ParamDict) -> Result<Tensor> {
    let mut acc: Option<Tensor> = None;
    for (k, s) in stats.iter() {
        let v = nat.get(k)?;
        if v.dims() != s.dims() {
            return Err(ParamError::ShapeMismatch {
                key: k.clone(),
                left: v.dims().to_vec(),
                right: s.dims().to_vec(),
            });
        }
        let term = v.mul(s)?.sum_all()?;
        acc = Some(match acc {
            Some(a) => (a + term)?,
            None => term,
        });
    }
    acc.ok_or(ParamError::KeyMismatch {
        expected: nat.keys(),
        got: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gaussian(trainable: bool) -> Result<ExpFamDistribution> {
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("loc", Tensor::new(&[0.0f64, 1.0], &dev)?)
            .with("scale", Tensor::new(&[1.0f64, 2.0], &dev)?);
        ExpFamDistribution::from_std(Family::MeanFieldGaussian, std, trainable)
    }

    #[test]
    fn natural_parameters_are_memoised() -> Result<()> {
        let q = gaussian(false)?;
        assert_eq!(q.authoritative(), Representation::Standard);
        assert!(!q.is_cached(Representation::Natural));
        q.nat_params()?;
        assert!(q.is_cached(Representation::Natural));
        Ok(())
    }

    #[test]
    fn setting_parameters_invalidates_derived() -> Result<()> {
        let mut q = gaussian(false)?;
        let nat = q.nat_params()?;
        q.set_std_params(q.std_params()?.scale(2.0)?)?;
        assert!(!q.is_cached(Representation::Natural));
        assert!(q.nat_params()?.max_abs_diff(&nat)? > 1e-3);

        q.set_nat_params(nat.clone())?;
        assert_eq!(q.authoritative(), Representation::Natural);
        assert!(!q.is_cached(Representation::Standard));
        Ok(())
    }

    #[test]
    fn trainable_exposes_only_unconstrained_vars() -> Result<()> {
        let q = gaussian(true)?;
        assert!(q.is_trainable());
        assert_eq!(q.authoritative(), Representation::Unconstrained);
        assert_eq!(q.parameters().len(), 2);
        assert!(gaussian(false)?.parameters().is_empty());
        Ok(())
    }

    #[test]
    fn copies_do_not_alias() -> Result<()> {
        let q = gaussian(true)?;
        let frozen = q.non_trainable_copy()?;
        let before = frozen.std_params()?;

        let shifted = q.unc_params()?.get("loc")?.affine(1.0, 5.0)?;
        q.parameters()[0].set(&shifted)?;

        assert!(frozen.std_params()?.max_abs_diff(&before)? < 1e-15);
        Ok(())
    }

    #[test]
    fn entropy_of_gaussian() -> Result<()> {
        let q = gaussian(false)?;
        let expected = 0.5 * (2.0 * std::f64::consts::PI * std::f64::consts::E).ln() * 2.0 + 2_f64.ln();
        assert_abs_diff_eq!(q.entropy()?, expected, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn dirichlet_cannot_rsample() -> Result<()> {
        let std = ParamDict::new().with("concentration", Tensor::new(&[1.0f64, 2.0], &Device::Cpu)?);
        let q = ExpFamDistribution::from_std(Family::Dirichlet, std, false)?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(q.rsample(3, &mut rng), Err(ParamError::Unsupported { .. })));
        assert_eq!(q.sample(3, &mut rng)?.dims(), &[3, 2]);
        Ok(())
    }

    #[test]
    fn log_prob_of_standard_normal_at_zero() -> Result<()> {
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("loc", Tensor::new(&[0.0f64], &dev)?)
            .with("scale", Tensor::new(&[1.0f64], &dev)?);
        let q = ExpFamDistribution::from_std(Family::MeanFieldGaussian, std, false)?;
        let lp = q.log_prob(&Tensor::new(&[[0.0f64]], &dev)?)?;
        assert_abs_diff_eq!(to_f64_vec(&lp)?[0], -0.5 * (2.0 * std::f64::consts::PI).ln(), epsilon = 1e-12);
        Ok(())
    }
}
