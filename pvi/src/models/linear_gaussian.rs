//! Bayesian linear regression with Gaussian noise.

use candle_core::{Device, Tensor, Var};
use expfam_param::tensor_util::scalar_f64;
use expfam_param::{ExpFamDistribution, ExpFamFactor, Family, ParamDict, ParamError};
use rand::rngs::StdRng;

use crate::data::Data;
use crate::error::Result;
use crate::model::{
    gaussian_moments, isotropic_gaussian_prior, monte_carlo_expected_log_likelihood,
    with_bias_column, Model,
};

/// `y = xᵀθ + ε`, `ε ~ N(0, σ²)`
///
/// ```text
/// log p(y | θ, x) = -0.5 * [log(2π) + 2 log σ + (y - xᵀθ)² / σ²]
/// ```
///
/// The likelihood is conjugate to a multivariate Gaussian over θ, so
/// `conjugate_update` is exact. `log σ` is a `Var` (optimised when the
/// client trains the model jointly) and can be replaced by a draw of ε in
/// the Bayesian hyperparameter setting.
pub struct LinearGaussianModel {
    include_bias: bool,
    log_noise_scale: Var,
    sampled_log_noise_scale: Option<Tensor>,
}

impl LinearGaussianModel {
    pub fn new(noise_std: f64, include_bias: bool, device: &Device) -> Result<Self> {
        Ok(Self {
            include_bias,
            log_noise_scale: Var::new(&[noise_std.ln()], device)?,
            sampled_log_noise_scale: None,
        })
    }

    /// Length of θ for `d` input columns.
    pub fn num_params(&self, d: usize) -> usize {
        d + usize::from(self.include_bias)
    }

    /// Isotropic prior `N(0, prior_var · I)` over θ.
    pub fn prior(&self, d: usize, prior_var: f64, device: &Device) -> Result<ExpFamDistribution> {
        isotropic_gaussian_prior(Family::MultivariateGaussian, self.num_params(d), prior_var, device)
    }

    fn design(&self, x: &Tensor) -> Result<Tensor> {
        if self.include_bias {
            with_bias_column(x)
        } else {
            Ok(x.clone())
        }
    }

    /// Current `log σ`, shape (1,)
    fn log_sigma(&self) -> Result<Tensor> {
        let ret = match &self.sampled_log_noise_scale {
            Some(eps) => eps.flatten_all()?,
            None => self.log_noise_scale.as_tensor().clone(),
        };
        Ok(ret)
    }

    pub fn noise_std(&self) -> Result<f64> {
        Ok(scalar_f64(&self.log_sigma()?.detach())?.exp())
    }

    /// Natural parameters of the exact likelihood term of `data`:
    /// `np1 = Xᵀy / σ²`, `np2 = -½ XᵀX / σ²`.
    pub fn likelihood_factor(&self, data: &Data) -> Result<ExpFamFactor> {
        let xd = self.design(&data.x)?;
        let inv_var = (-2.0 * self.noise_std()?.ln()).exp();

        let np1 = xd.t()?.matmul(&data.y.unsqueeze(1)?)?.squeeze(1)?;
        let np2 = xd.t()?.matmul(&xd)?;
        let nat = ParamDict::new()
            .with("np1", np1.affine(inv_var, 0.0)?)
            .with("np2", np2.affine(-0.5 * inv_var, 0.0)?);
        Ok(ExpFamFactor::new(Family::MultivariateGaussian, nat)?)
    }
}

impl Model for LinearGaussianModel {
    fn conjugate_family(&self) -> Option<Family> {
        Some(Family::MultivariateGaussian)
    }

    fn conjugate_update(
        &self,
        data: &Data,
        q: &ExpFamDistribution,
        t: Option<&ExpFamFactor>,
    ) -> Result<(ExpFamDistribution, ExpFamFactor)> {
        if q.family() != Family::MultivariateGaussian {
            return Err(ParamError::FamilyMismatch {
                left: Family::MultivariateGaussian,
                right: q.family(),
            }
            .into());
        }

        let t_new = self.likelihood_factor(data)?;
        let mut nat = q.nat_params()?.detach();
        if let Some(t_old) = t {
            nat = nat.sub(t_old.nat_params())?;
        }
        nat = nat.add(t_new.nat_params())?;

        Ok((q.with_nat_params(nat)?, t_new))
    }

    fn likelihood_log_prob(&self, data: &Data, thetas: &Tensor) -> Result<Tensor> {
        let xd = self.design(&data.x)?;
        let log_sigma = self.log_sigma()?;
        let inv_var = log_sigma.affine(-2.0, 0.0)?.exp()?;
        let ln_2pi: f64 = (2.0 * std::f64::consts::PI).ln();

        // (S, N)
        let mean = thetas.matmul(&xd.t()?)?;
        let diff_sq = mean.broadcast_sub(&data.y.unsqueeze(0)?)?.sqr()?;
        let log_prob = diff_sq
            .broadcast_mul(&inv_var)?
            .affine(-0.5, -0.5 * ln_2pi)?
            .broadcast_sub(&log_sigma)?;
        Ok(log_prob)
    }

    /// Closed form for Gaussian q:
    /// `Σ_n -½ [log 2π + 2 log σ + ((y_n - x_nᵀμ)² + x_nᵀ Σ x_n) / σ²]`
    fn expected_log_likelihood(
        &self,
        data: &Data,
        q: &ExpFamDistribution,
        num_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        if !matches!(
            q.family(),
            Family::MultivariateGaussian | Family::MeanFieldGaussian
        ) {
            return monte_carlo_expected_log_likelihood(self, data, q, num_samples, rng);
        }

        let (loc, cov) = gaussian_moments(q)?;
        let xd = self.design(&data.x)?;
        let n = data.len() as f64;
        let ln_2pi: f64 = (2.0 * std::f64::consts::PI).ln();

        let pred = xd.matmul(&loc.unsqueeze(1)?)?.squeeze(1)?;
        let resid_sq = data.y.sub(&pred)?.sqr()?;
        let quad = xd.matmul(&cov)?.mul(&xd)?.sum(1)?;
        let total_sq = (resid_sq + quad)?.sum_all()?;

        let log_sigma = self.log_sigma()?;
        let inv_var = log_sigma.affine(-2.0, 0.0)?.exp()?;
        let ret = total_sq
            .broadcast_mul(&inv_var)?
            .affine(-0.5, -0.5 * ln_2pi * n)?
            .sub(&log_sigma.affine(n, 0.0)?)?;
        Ok(ret.sum_all()?)
    }

    fn trainable_variables(&self) -> Vec<Var> {
        vec![self.log_noise_scale.clone()]
    }

    /// `eps` is a draw of `log σ`.
    fn set_hyperparameters(&mut self, eps: &Tensor) -> Result<()> {
        self.sampled_log_noise_scale = Some(eps.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use expfam_param::tensor_util::to_f64_vec;
    use rand::SeedableRng;

    fn toy() -> Result<(LinearGaussianModel, Data)> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1.0f64], [2.0], [-1.0]], &dev)?;
        let y = Tensor::new(&[1.5f64, 2.5, -0.5], &dev)?;
        Ok((LinearGaussianModel::new(0.5, false, &dev)?, Data::new(x, y)?))
    }

    #[test]
    fn log_prob_matches_normal_density() -> Result<()> {
        let (model, data) = toy()?;
        let theta = Tensor::new(&[[1.0f64]], &Device::Cpu)?;
        let lp = to_f64_vec(&model.likelihood_log_prob(&data, &theta)?)?;
        let expected = |r: f64| -0.5 * (2.0 * std::f64::consts::PI * 0.25).ln() - 0.5 * r * r / 0.25;
        assert_abs_diff_eq!(lp[0], expected(0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(lp[2], expected(0.5), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn closed_form_ell_matches_point_mass_limit() -> Result<()> {
        let (model, data) = toy()?;
        let dev = Device::Cpu;
        let std = ParamDict::new()
            .with("loc", Tensor::new(&[1.0f64], &dev)?)
            .with("covariance_matrix", Tensor::new(&[[1e-12f64]], &dev)?);
        let q = ExpFamDistribution::from_std(Family::MultivariateGaussian, std, false)?;

        let mut rng = StdRng::seed_from_u64(0);
        let ell = scalar_f64(&model.expected_log_likelihood(&data, &q, 1, &mut rng)?)?;
        let theta = Tensor::new(&[[1.0f64]], &dev)?;
        let direct: f64 = to_f64_vec(&model.likelihood_log_prob(&data, &theta)?)?.iter().sum();
        assert_abs_diff_eq!(ell, direct, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn hyperparameter_draw_overrides_noise() -> Result<()> {
        let (mut model, _) = toy()?;
        model.set_hyperparameters(&Tensor::new(&[[0.0f64]], &Device::Cpu)?)?;
        assert_abs_diff_eq!(model.noise_std()?, 1.0, epsilon = 1e-12);
        Ok(())
    }
}
