//! Synthetic data split across clients.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Gamma, Normal, StandardNormal};

use crate::data::Data;
use crate::error::{PviError, Result};

pub struct SimArgs {
    pub rows: usize,
    pub cols: usize,
    pub clients: usize,
    /// Gamma shape of the partition proportions; small values make the
    /// partitions very unequal.
    pub heterogeneity: f64,
    pub noise_std: f64,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            rows: 1000,
            cols: 2,
            clients: 4,
            heterogeneity: 1.0,
            noise_std: 1.0,
            rseed: 42,
        }
    }
}

/// Simulated partitions and the coefficients that generated them.
pub struct SimOut {
    pub partitions: Vec<Data>,
    pub theta: Vec<f64>,
}

/// Partition sizes summing to `rows`, each at least one, with proportions
/// drawn from normalised `Gamma(heterogeneity, 1)` variables.
pub fn partition_sizes(args: &SimArgs, rng: &mut StdRng) -> Result<Vec<usize>> {
    let (nn, kk) = (args.rows, args.clients);
    if kk == 0 || nn < kk {
        return Err(PviError::Config(format!(
            "cannot split {} rows across {} clients",
            nn, kk
        )));
    }

    let rgamma = Gamma::new(args.heterogeneity, 1.0)
        .map_err(|e| PviError::Config(format!("heterogeneity: {}", e)))?;
    let weights = (0..kk).map(|_| rgamma.sample(rng)).collect::<Vec<f64>>();
    let tot: f64 = weights.iter().sum();

    // one row each, the rest by proportion
    let spare = nn - kk;
    let mut sizes = weights
        .iter()
        .map(|w| 1 + ((w / tot) * spare as f64).floor() as usize)
        .collect::<Vec<_>>();

    let assigned: usize = sizes.iter().sum();
    let largest = weights
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, _)| k)
        .unwrap_or(0);
    sizes[largest] += nn - assigned;
    Ok(sizes)
}

fn split(x: Vec<f64>, y: Vec<f64>, dd: usize, sizes: &[usize], device: &Device) -> Result<Vec<Data>> {
    let mut ret = Vec::with_capacity(sizes.len());
    let mut lb = 0;
    for &nk in sizes {
        let xk = Tensor::from_slice(&x[lb * dd..(lb + nk) * dd], (nk, dd), device)?;
        let yk = Tensor::from_slice(&y[lb..lb + nk], nk, device)?;
        ret.push(Data::new(xk, yk)?);
        lb += nk;
    }
    Ok(ret)
}

fn sample_design(args: &SimArgs, rng: &mut StdRng) -> (Vec<f64>, Vec<f64>) {
    let x = (0..args.rows * args.cols)
        .map(|_| StandardNormal.sample(rng))
        .collect::<Vec<f64>>();
    let theta = (0..args.cols)
        .map(|_| StandardNormal.sample(rng))
        .collect::<Vec<f64>>();
    (x, theta)
}

fn linear_predictor(x: &[f64], theta: &[f64]) -> Vec<f64> {
    x.chunks(theta.len())
        .map(|row| row.iter().zip(theta).map(|(a, b)| a * b).sum())
        .collect()
}

/// ```text
/// x_n ~ N(0, I), θ ~ N(0, I), y_n ~ N(x_nᵀθ, noise_std²)
/// ```
pub fn generate_regression_data(args: &SimArgs, device: &Device) -> Result<SimOut> {
    let mut rng = StdRng::seed_from_u64(args.rseed);
    let sizes = partition_sizes(args, &mut rng)?;

    let (x, theta) = sample_design(args, &mut rng);
    let noise = Normal::new(0.0, args.noise_std)
        .map_err(|e| PviError::Config(format!("noise_std: {}", e)))?;
    let y = linear_predictor(&x, &theta)
        .into_iter()
        .map(|mu| mu + noise.sample(&mut rng))
        .collect::<Vec<_>>();

    Ok(SimOut {
        partitions: split(x, y, args.cols, &sizes, device)?,
        theta,
    })
}

/// ```text
/// x_n ~ N(0, I), θ ~ N(0, I), y_n ~ Bernoulli(σ(x_nᵀθ))
/// ```
pub fn generate_classification_data(args: &SimArgs, device: &Device) -> Result<SimOut> {
    let mut rng = StdRng::seed_from_u64(args.rseed);
    let sizes = partition_sizes(args, &mut rng)?;

    let (x, theta) = sample_design(args, &mut rng);
    let y = linear_predictor(&x, &theta)
        .into_iter()
        .map(|eta| {
            let p = 1.0 / (1.0 + (-eta).exp());
            let coin = Bernoulli::new(p).map_err(|e| PviError::Config(format!("{}", e)))?;
            Ok(if coin.sample(&mut rng) { 1.0 } else { 0.0 })
        })
        .collect::<Result<Vec<f64>>>()?;

    Ok(SimOut {
        partitions: split(x, y, args.cols, &sizes, device)?,
        theta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_cover_all_rows() -> Result<()> {
        let args = SimArgs {
            rows: 101,
            clients: 5,
            heterogeneity: 0.3,
            ..Default::default()
        };
        let out = generate_regression_data(&args, &Device::Cpu)?;
        assert_eq!(out.partitions.len(), 5);
        assert_eq!(out.partitions.iter().map(|d| d.len()).sum::<usize>(), 101);
        assert!(out.partitions.iter().all(|d| !d.is_empty()));
        assert_eq!(out.theta.len(), 2);
        Ok(())
    }

    #[test]
    fn same_seed_same_data() -> Result<()> {
        let args = SimArgs::default();
        let a = generate_classification_data(&args, &Device::Cpu)?;
        let b = generate_classification_data(&args, &Device::Cpu)?;
        assert_eq!(a.theta, b.theta);
        assert_eq!(
            a.partitions[0].y.to_vec1::<f64>()?,
            b.partitions[0].y.to_vec1::<f64>()?
        );
        Ok(())
    }

    #[test]
    fn too_many_clients() {
        let args = SimArgs {
            rows: 3,
            clients: 4,
            ..Default::default()
        };
        assert!(generate_regression_data(&args, &Device::Cpu).is_err());
    }
}
