use candle_core::{DType, Device, Tensor, Var};
use expfam_param::{ExpFamDistribution, ExpFamFactor, Family, ParamDict};
use rand::rngs::StdRng;

use crate::data::Data;
use crate::error::{PviError, Result};

/// A likelihood `p(y | θ, x)` that clients refine their factors against.
///
/// Only `likelihood_log_prob` is required; everything else has either a
/// Monte-Carlo default or reports `Unimplemented`.
pub trait Model {
    /// Family the likelihood is conjugate to. A client takes the closed-form
    /// branch iff this equals the incoming posterior's family.
    fn conjugate_family(&self) -> Option<Family> {
        None
    }

    /// Closed-form refinement: the new posterior `q / t × t_new` and the
    /// exact likelihood factor `t_new`. Without `t` nothing is divided out.
    fn conjugate_update(
        &self,
        _data: &Data,
        _q: &ExpFamDistribution,
        _t: Option<&ExpFamFactor>,
    ) -> Result<(ExpFamDistribution, ExpFamFactor)> {
        Err(PviError::Unimplemented("conjugate update for this model"))
    }

    /// `log p(y_n | θ_s, x_n)` with shape (S, N) for `thetas` of shape (S, ...)
    fn likelihood_log_prob(&self, data: &Data, thetas: &Tensor) -> Result<Tensor>;

    /// `Σ_n E_q[log p(y_n | θ, x_n)]` as a scalar tensor.
    fn expected_log_likelihood(
        &self,
        data: &Data,
        q: &ExpFamDistribution,
        num_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        monte_carlo_expected_log_likelihood(self, data, q, num_samples, rng)
    }

    /// Model variables optimised jointly with q when `train_model` is set.
    fn trainable_variables(&self) -> Vec<Var> {
        vec![]
    }

    /// Plug in a (possibly differentiable) draw of the hyperparameters ε.
    fn set_hyperparameters(&mut self, _eps: &Tensor) -> Result<()> {
        Err(PviError::Unimplemented("hyperparameters for this model"))
    }
}

/// `(1/S) Σ_s Σ_n log p(y_n | θ_s, x_n)` with `θ_s ~ q` reparameterised.
pub fn monte_carlo_expected_log_likelihood<M: Model + ?Sized>(
    model: &M,
    data: &Data,
    q: &ExpFamDistribution,
    num_samples: usize,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let thetas = q.rsample(num_samples, rng)?;
    Ok(model.likelihood_log_prob(data, &thetas)?.mean(0)?.sum_all()?)
}

/// `N(0, prior_var · I)` over `p` coefficients, as a full-covariance or
/// diagonal Gaussian.
pub fn isotropic_gaussian_prior(
    family: Family,
    p: usize,
    prior_var: f64,
    device: &Device,
) -> Result<ExpFamDistribution> {
    let loc = Tensor::zeros(p, DType::F64, device)?;
    let std = match family {
        Family::MultivariateGaussian => ParamDict::new().with("loc", loc).with(
            "covariance_matrix",
            Tensor::eye(p, DType::F64, device)?.affine(prior_var, 0.0)?,
        ),
        Family::MeanFieldGaussian => ParamDict::new()
            .with("loc", loc)
            .with("scale", Tensor::full(prior_var.sqrt(), p, device)?),
        family => {
            return Err(PviError::Param(expfam_param::ParamError::Unsupported {
                family,
                what: "isotropic Gaussian prior",
            }))
        }
    };
    Ok(ExpFamDistribution::from_std(family, std, false)?)
}

/// Append a column of ones: (N, D) -> (N, D + 1)
pub(crate) fn with_bias_column(x: &Tensor) -> Result<Tensor> {
    let ones = Tensor::ones((x.dim(0)?, 1), x.dtype(), x.device())?;
    Ok(Tensor::cat(&[x, &ones], 1)?)
}

/// Posterior mean and covariance of a Gaussian q, as tensors carrying
/// whatever gradients q's standard parameters carry.
pub(crate) fn gaussian_moments(q: &ExpFamDistribution) -> Result<(Tensor, Tensor)> {
    let std = q.std_params()?;
    let loc = std.get("loc")?.clone();
    let cov = match q.family() {
        Family::MultivariateGaussian => std.get("covariance_matrix")?.clone(),
        Family::MeanFieldGaussian => {
            let var = std.get("scale")?.sqr()?;
            let eye = Tensor::eye(var.dim(0)?, var.dtype(), var.device())?;
            eye.broadcast_mul(&var.unsqueeze(0)?)?
        }
        family => {
            return Err(PviError::Param(expfam_param::ParamError::Unsupported {
                family,
                what: "Gaussian moments",
            }))
        }
    };
    Ok((loc, cov))
}
