//! Multiclass (softmax) logistic regression.

use candle_core::{Device, Tensor, D};
use expfam_param::tensor_util::{from_f64_vec, to_f64_vec};
use expfam_param::{ExpFamDistribution, Family};
use rand::rngs::StdRng;

use crate::data::Data;
use crate::error::{PviError, Result};
use crate::model::{isotropic_gaussian_prior, with_bias_column, Model};

/// `y ~ Categorical(softmax(Θ x))` with `y ∈ {0, .., C - 1}`.
///
/// θ is the row-major flattening of the (C, P) weight matrix Θ, so a
/// Gaussian q over θ has `C · P` coordinates. Not conjugate to anything.
pub struct MulticlassLogisticRegressionModel {
    num_classes: usize,
    include_bias: bool,
}

impl MulticlassLogisticRegressionModel {
    pub fn new(num_classes: usize, include_bias: bool) -> Self {
        Self {
            num_classes,
            include_bias,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Length of θ for `d` input columns.
    pub fn num_params(&self, d: usize) -> usize {
        self.num_classes * (d + usize::from(self.include_bias))
    }

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

    /// Class logits, shape (S, N, C), for θ of shape (S, C · P)
    fn logits(&self, x: &Tensor, thetas: &Tensor) -> Result<Tensor> {
        let xd = self.design(x)?;
        let pp = xd.dim(1)?;
        let (ss, cp) = thetas.dims2()?;
        if cp != self.num_classes * pp {
            return Err(PviError::Consistency(format!(
                "θ has {} coordinates, expected {} classes × {} inputs",
                cp, self.num_classes, pp
            )));
        }

        let weights = thetas
            .reshape((ss, self.num_classes, pp))?
            .transpose(1, 2)?
            .contiguous()?;
        let xs = xd.broadcast_left(ss)?.contiguous()?;
        Ok(xs.matmul(&weights)?)
    }

    /// One-hot rows of the labels, shape (N, C)
    fn one_hot(&self, y: &Tensor) -> Result<Tensor> {
        let labels = to_f64_vec(y)?;
        let cc = self.num_classes;
        let mut data = vec![0_f64; labels.len() * cc];
        for (n, &label) in labels.iter().enumerate() {
            let k = label.round();
            if k < 0.0 || k >= cc as f64 || (label - k).abs() > 1e-9 {
                return Err(PviError::Consistency(format!(
                    "label {} is not a class in 0..{}",
                    label, cc
                )));
            }
            data[n * cc + k as usize] = 1.0;
        }
        Ok(from_f64_vec(data, (labels.len(), cc), y.dtype(), y.device())?)
    }

    /// Monte-Carlo predictive `(1/S) Σ_s softmax(Θ_s x)`, shape (N, C)
    pub fn predictive_probs(
        &self,
        x: &Tensor,
        q: &ExpFamDistribution,
        num_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let thetas = q.sample(num_samples.max(1), rng)?;
        let probs = candle_nn::ops::softmax(&self.logits(x, &thetas)?, D::Minus1)?;
        Ok(probs.mean(0)?)
    }
}

impl Model for MulticlassLogisticRegressionModel {
    /// `log softmax(Θ x)_y`
    fn likelihood_log_prob(&self, data: &Data, thetas: &Tensor) -> Result<Tensor> {
        let log_probs = candle_nn::ops::log_softmax(&self.logits(&data.x, thetas)?, D::Minus1)?;
        let one_hot = self.one_hot(&data.y)?.to_dtype(log_probs.dtype())?;
        Ok(log_probs.broadcast_mul(&one_hot.unsqueeze(0)?)?.sum(2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn toy() -> Result<Data> {
        let dev = Device::Cpu;
        Data::new(
            Tensor::new(&[[1.0f64, 0.0], [0.0, 1.0]], &dev)?,
            Tensor::new(&[0.0f64, 2.0], &dev)?,
        )
    }

    #[test]
    fn flat_weights_give_uniform_classes() -> Result<()> {
        let model = MulticlassLogisticRegressionModel::new(3, true);
        let thetas = Tensor::zeros((4, model.num_params(2)), candle_core::DType::F64, &Device::Cpu)?;
        let lp = model.likelihood_log_prob(&toy()?, &thetas)?;
        assert_eq!(lp.dims(), &[4, 2]);
        for v in to_f64_vec(&lp)? {
            assert_abs_diff_eq!(v, -(3_f64.ln()), epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn weights_are_rows_per_class() -> Result<()> {
        let model = MulticlassLogisticRegressionModel::new(3, false);
        // class 2 scores x_1, the others score nothing
        let theta = Tensor::new(&[[0.0f64, 0.0, 0.0, 0.0, 0.0, 4.0]], &Device::Cpu)?;
        let lp = to_f64_vec(&model.likelihood_log_prob(&toy()?, &theta)?)?;

        assert_abs_diff_eq!(lp[0], -(3_f64.ln()), epsilon = 1e-12);
        let expected = 4.0 - (2.0 + 4_f64.exp()).ln();
        assert_abs_diff_eq!(lp[1], expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn labels_outside_the_classes_are_rejected() -> Result<()> {
        let model = MulticlassLogisticRegressionModel::new(2, false);
        let thetas = Tensor::zeros((1, 4), candle_core::DType::F64, &Device::Cpu)?;
        assert!(matches!(
            model.likelihood_log_prob(&toy()?, &thetas),
            Err(PviError::Consistency(_))
        ));
        Ok(())
    }

    #[test]
    fn predictive_rows_sum_to_one() -> Result<()> {
        let dev = Device::Cpu;
        let model = MulticlassLogisticRegressionModel::new(4, true);
        let q = model.prior(Family::MultivariateGaussian, 2, 1.0, &dev)?;
        let mut rng = StdRng::seed_from_u64(2);
        let probs = model.predictive_probs(&toy()?.x, &q, 8, &mut rng)?;
        assert_eq!(probs.dims(), &[2, 4]);
        for row in probs.to_vec2::<f64>()? {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        }
        Ok(())
    }
}
