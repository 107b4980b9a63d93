//! Bayesian logistic regression.

use candle_core::{Device, Tensor};
use expfam_param::{ExpFamDistribution, Family};

use crate::data::Data;
use crate::error::Result;
use crate::model::{gaussian_moments, isotropic_gaussian_prior, with_bias_column, Model};

/// `y ~ Bernoulli(σ(xᵀθ))` with `y ∈ {0, 1}`; no conjugate family, so
/// clients always take the gradient branch.
pub struct LogisticRegressionModel {
    include_bias: bool,
}

/// `log(1 + exp(η))` without overflow
fn softplus(eta: &Tensor) -> Result<Tensor> {
    let tail = (eta.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((eta.relu()? + tail)?)
}

impl LogisticRegressionModel {
    pub fn new(include_bias: bool) -> Self {
        Self { include_bias }
    }

    pub fn num_params(&self, d: usize) -> usize {
        d + usize::from(self.include_bias)
    }

    /// Isotropic prior `N(0, prior_var · I)` over θ; full covariance
    /// unless `family` is mean-field.
    pub fn prior(
        &self,
        family: Family,
        d: usize,
        prior_var: f64,
        device: &Device,
    ) -> Result<ExpFamDistribution> {
        let family = match family {
            Family::MeanFieldGaussian => family,
            _ => Family::MultivariateGaussian,
        };
        isotropic_gaussian_prior(family, self.num_params(d), prior_var, device)
    }

    fn design(&self, x: &Tensor) -> Result<Tensor> {
        if self.include_bias {
            with_bias_column(x)
        } else {
            Ok(x.clone())
        }
    }

    /// Probit approximation of the predictive `p(y = 1 | x)`:
    /// `σ(xᵀμ / sqrt(1 + π xᵀΣx / 8))`, shape (N,)
    pub fn predictive_probs(&self, x: &Tensor, q: &ExpFamDistribution) -> Result<Tensor> {
        let (loc, cov) = gaussian_moments(q)?;
        let (loc, cov) = (loc.detach(), cov.detach());
        let xd = self.design(x)?;

        let mean = xd.matmul(&loc.unsqueeze(1)?)?.squeeze(1)?;
        let var = xd.matmul(&cov)?.mul(&xd)?.sum(1)?;
        let denom = var.affine(std::f64::consts::PI / 8.0, 1.0)?.sqrt()?;
        Ok(candle_nn::ops::sigmoid(&mean.div(&denom)?)?)
    }
}

impl Model for LogisticRegressionModel {
    /// `y η - log(1 + exp(η))` with `η = xᵀθ`
    fn likelihood_log_prob(&self, data: &Data, thetas: &Tensor) -> Result<Tensor> {
        let xd = self.design(&data.x)?;
        // (S, N)
        let eta = thetas.matmul(&xd.t()?)?;
        let y = data.y.to_dtype(eta.dtype())?.unsqueeze(0)?;
        Ok((eta.broadcast_mul(&y)? - softplus(&eta)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use expfam_param::tensor_util::to_f64_vec;
    use expfam_param::ParamDict;

    #[test]
    fn softplus_is_stable() -> Result<()> {
        let eta = Tensor::new(&[-800.0f64, 0.0, 800.0], &Device::Cpu)?;
        let sp = to_f64_vec(&softplus(&eta)?)?;
        assert_abs_diff_eq!(sp[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sp[1], 2_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(sp[2], 800.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn bernoulli_log_prob() -> Result<()> {
        let dev = Device::Cpu;
        let model = LogisticRegressionModel::new(false);
        let data = Data::new(
            Tensor::new(&[[1.0f64], [1.0]], &dev)?,
            Tensor::new(&[1.0f64, 0.0], &dev)?,
        )?;
        let theta = Tensor::new(&[[0.0f64]], &dev)?;
        let lp = to_f64_vec(&model.likelihood_log_prob(&data, &theta)?)?;
        assert_abs_diff_eq!(lp[0], 0.5_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(lp[1], 0.5_f64.ln(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn probit_predictive_shrinks_with_uncertainty() -> Result<()> {
        let dev = Device::Cpu;
        let model = LogisticRegressionModel::new(false);
        let x = Tensor::new(&[[2.0f64]], &dev)?;

        let sharp = model.prior(Family::MultivariateGaussian, 1, 1e-8, &dev)?;
        let sharp = sharp.with_nat_params(
            sharp
                .nat_params()?
                .add(&ParamDict::new().with("np1", Tensor::new(&[1e8f64], &dev)?).with(
                    "np2",
                    Tensor::new(&[[0.0f64]], &dev)?,
                ))?,
        )?;
        let p_sharp = to_f64_vec(&model.predictive_probs(&x, &sharp)?)?[0];
        assert_abs_diff_eq!(p_sharp, 1.0 / (1.0 + (-2.0f64).exp()), epsilon = 1e-6);

        let wide = model.prior(Family::MultivariateGaussian, 1, 100.0, &dev)?;
        let p_wide = to_f64_vec(&model.predictive_probs(&x, &wide)?)?[0];
        assert_abs_diff_eq!(p_wide, 0.5, epsilon = 1e-12);
        Ok(())
    }
}
