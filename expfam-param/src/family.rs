use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{ParamError, Result};
use crate::families::categorical::multinomial;
use crate::families::gaussian::log_normal;
use crate::families::*;
use crate::param_dict::ParamDict;

/// Exponential-family members supported by `ExpFamDistribution`.
///
/// The tag is carried by both distributions and models, so picking the
/// conjugate branch is a tag comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    MeanFieldGaussian,
    MultivariateGaussian,
    Dirichlet,
    Categorical,
    Multinomial,
    Gamma,
    Beta,
    LogNormal,
}

/// Which of the three parameterisations is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Standard,
    Natural,
    Unconstrained,
}

impl Family {
    pub const ALL: [Family; 8] = [
        Family::MeanFieldGaussian,
        Family::MultivariateGaussian,
        Family::Dirichlet,
        Family::Categorical,
        Family::Multinomial,
        Family::Gamma,
        Family::Beta,
        Family::LogNormal,
    ];

    pub fn std_keys(&self) -> &'static [&'static str] {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::STD_KEYS,
            Family::MultivariateGaussian => multivariate_gaussian::STD_KEYS,
            Family::Dirichlet => dirichlet::STD_KEYS,
            Family::Categorical => categorical::STD_KEYS,
            Family::Multinomial => multinomial::STD_KEYS,
            Family::Gamma => gamma::STD_KEYS,
            Family::Beta => beta::STD_KEYS,
        }
    }

    pub fn nat_keys(&self) -> &'static [&'static str] {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::NAT_KEYS,
            Family::MultivariateGaussian => multivariate_gaussian::NAT_KEYS,
            Family::Dirichlet => dirichlet::NAT_KEYS,
            Family::Categorical => categorical::NAT_KEYS,
            Family::Multinomial => multinomial::NAT_KEYS,
            Family::Gamma => gamma::NAT_KEYS,
            Family::Beta => beta::NAT_KEYS,
        }
    }

    pub fn unc_keys(&self) -> &'static [&'static str] {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::UNC_KEYS,
            Family::MultivariateGaussian => multivariate_gaussian::UNC_KEYS,
            Family::Dirichlet => dirichlet::UNC_KEYS,
            Family::Categorical => categorical::UNC_KEYS,
            Family::Multinomial => multinomial::UNC_KEYS,
            Family::Gamma => gamma::UNC_KEYS,
            Family::Beta => beta::UNC_KEYS,
        }
    }

    /// Natural-parameter keys that pair with a sufficient statistic.
    /// Everything except the multinomial's trial count.
    pub fn stat_keys(&self) -> &'static [&'static str] {
        match self {
            Family::Multinomial => multinomial::STAT_KEYS,
            _ => self.nat_keys(),
        }
    }

    /// Unconstrained keys held fixed during optimisation.
    pub fn fixed_unc_keys(&self) -> &'static [&'static str] {
        match self {
            Family::Multinomial => multinomial::FIXED_KEYS,
            _ => &[],
        }
    }

    /// Whether `rsample` (pathwise gradients) is available.
    pub fn is_reparameterisable(&self) -> bool {
        matches!(
            self,
            Family::MeanFieldGaussian | Family::MultivariateGaussian | Family::LogNormal
        )
    }

    pub fn nat_from_std(&self, std: &ParamDict) -> Result<ParamDict> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::nat_from_std(std),
            Family::MultivariateGaussian => multivariate_gaussian::nat_from_std(std),
            Family::Dirichlet => dirichlet::nat_from_std(std),
            Family::Categorical => categorical::nat_from_std(std),
            Family::Multinomial => multinomial::nat_from_std(std),
            Family::Gamma => gamma::nat_from_std(std),
            Family::Beta => beta::nat_from_std(std),
        }
    }

    pub fn std_from_nat(&self, nat: &ParamDict) -> Result<ParamDict> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::std_from_nat(nat),
            Family::MultivariateGaussian => multivariate_gaussian::std_from_nat(nat),
            Family::Dirichlet => dirichlet::std_from_nat(nat),
            Family::Categorical => categorical::std_from_nat(nat),
            Family::Multinomial => multinomial::std_from_nat(nat),
            Family::Gamma => gamma::std_from_nat(nat),
            Family::Beta => beta::std_from_nat(nat),
        }
    }

    pub fn unc_from_std(&self, std: &ParamDict) -> Result<ParamDict> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::unc_from_std(std),
            Family::MultivariateGaussian => multivariate_gaussian::unc_from_std(std),
            Family::Dirichlet => dirichlet::unc_from_std(std),
            Family::Categorical => categorical::unc_from_std(std),
            Family::Multinomial => multinomial::unc_from_std(std),
            Family::Gamma => gamma::unc_from_std(std),
            Family::Beta => beta::unc_from_std(std),
        }
    }

    pub fn std_from_unc(&self, unc: &ParamDict) -> Result<ParamDict> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::std_from_unc(unc),
            Family::MultivariateGaussian => multivariate_gaussian::std_from_unc(unc),
            Family::Dirichlet => dirichlet::std_from_unc(unc),
            Family::Categorical => categorical::std_from_unc(unc),
            Family::Multinomial => multinomial::std_from_unc(unc),
            Family::Gamma => gamma::std_from_unc(unc),
            Family::Beta => beta::std_from_unc(unc),
        }
    }

    /// Log-normaliser `A(ν)`, evaluated off-graph.
    pub fn log_a(&self, nat: &ParamDict) -> Result<f64> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::log_a(nat),
            Family::MultivariateGaussian => multivariate_gaussian::log_a(nat),
            Family::Dirichlet => dirichlet::log_a(nat),
            Family::Categorical => categorical::log_a(nat),
            Family::Multinomial => multinomial::log_a(nat),
            Family::Gamma => gamma::log_a(nat),
            Family::Beta => beta::log_a(nat),
        }
    }

    /// Expected sufficient statistics `E[f(θ)]` from standard parameters,
    /// keyed by the natural-parameter key they pair with. Differentiable
    /// for the Gaussian families; constants otherwise.
    pub fn expected_stats(&self, std: &ParamDict) -> Result<ParamDict> {
        match self {
            Family::MeanFieldGaussian | Family::LogNormal => gaussian::expected_stats(std),
            Family::MultivariateGaussian => multivariate_gaussian::expected_stats(std),
            Family::Dirichlet => dirichlet::expected_stats(std),
            Family::Categorical => categorical::expected_stats(std),
            Family::Multinomial => multinomial::expected_stats(std),
            Family::Gamma => gamma::expected_stats(std),
            Family::Beta => beta::expected_stats(std),
        }
    }

    /// Mean-parameter map `ν ↦ E_ν[f(θ)]`.
    pub fn mean_params(&self, nat: &ParamDict) -> Result<ParamDict> {
        self.expected_stats(&self.std_from_nat(nat)?)
    }

    /// `ν·f(θ)` for each row of a sample batch, shape (N,)
    pub fn npf(&self, nat: &ParamDict, thetas: &Tensor) -> Result<Tensor> {
        match self {
            Family::MeanFieldGaussian => gaussian::npf(nat, thetas),
            Family::LogNormal => log_normal::npf(nat, thetas),
            Family::MultivariateGaussian => multivariate_gaussian::npf(nat, thetas),
            Family::Dirichlet => dirichlet::npf(nat, thetas),
            Family::Categorical => categorical::npf(nat, thetas),
            Family::Multinomial => multinomial::npf(nat, thetas),
            Family::Gamma => gamma::npf(nat, thetas),
            Family::Beta => beta::npf(nat, thetas),
        }
    }

    /// Base measure `ln h(θ)` for each row, shape (N,)
    pub fn log_h(&self, thetas: &Tensor) -> Result<Tensor> {
        match self {
            Family::MeanFieldGaussian => gaussian::log_h(thetas),
            Family::LogNormal => log_normal::log_h(thetas),
            Family::MultivariateGaussian => multivariate_gaussian::log_h(thetas),
            Family::Dirichlet => dirichlet::log_h(thetas),
            Family::Categorical => categorical::log_h(thetas),
            Family::Multinomial => multinomial::log_h(thetas),
            Family::Gamma => gamma::log_h(thetas),
            Family::Beta => beta::log_h(thetas),
        }
    }

    /// `E[ln h(θ)]` where it has a closed form.
    pub fn expected_log_h(&self, std: &ParamDict) -> Result<f64> {
        match self {
            Family::MeanFieldGaussian => gaussian::expected_log_h(std),
            Family::LogNormal => log_normal::expected_log_h(std),
            Family::MultivariateGaussian => multivariate_gaussian::expected_log_h(std),
            Family::Dirichlet | Family::Categorical | Family::Gamma | Family::Beta => Ok(0.0),
            Family::Multinomial => Err(ParamError::Unsupported {
                family: *self,
                what: "closed-form entropy",
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::MeanFieldGaussian => "mean-field-gaussian",
            Family::MultivariateGaussian => "multivariate-gaussian",
            Family::Dirichlet => "dirichlet",
            Family::Categorical => "categorical",
            Family::Multinomial => "multinomial",
            Family::Gamma => "gamma",
            Family::Beta => "beta",
            Family::LogNormal => "log-normal",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Family {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        Family::ALL
            .iter()
            .find(|f| f.name() == s)
            .copied()
            .or(match s.as_str() {
                "mfg" | "gaussian" => Some(Family::MeanFieldGaussian),
                "mvn" => Some(Family::MultivariateGaussian),
                _ => None,
            })
            .ok_or(ParamError::UnknownFamily(s))
    }
}

/// Fail unless `params` has exactly `keys`. Simplex families hold a single
/// K-vector; normalisers and draws reduce over all of it, so batched
/// (rank > 1) parameters are refused.
pub(crate) fn check_keys(family: Family, params: &ParamDict, keys: &[&str]) -> Result<()> {
    let mut expected = keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
    expected.sort();
    let got = params.keys();
    if got != expected {
        return Err(ParamError::KeyMismatch { expected, got });
    }

    if matches!(
        family,
        Family::Dirichlet | Family::Categorical | Family::Multinomial
    ) && params.iter().any(|(_, v)| v.rank() > 1)
    {
        return Err(ParamError::Unsupported {
            family,
            what: "batched parameters",
        });
    }
    Ok(())
}
