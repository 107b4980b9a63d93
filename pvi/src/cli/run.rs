use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Args, ValueEnum};
use expfam_param::tensor_util::to_f64_vec;
use expfam_param::{ExpFamDistribution, ExpFamFactor, Family, ParamDict};
use log::info;

use crate::client::{BayesianContinualLearningClient, ContinualLearningClient, PviClient};
use crate::config::RunConfig;
use crate::data::Data;
use crate::model::{isotropic_gaussian_prior, Model};
use crate::models::{LinearGaussianModel, LogisticRegressionModel};
use crate::server::{
    AsynchronousServer, BayesianContinualLearningServer, ContinualLearningServer, Server,
    SynchronousServer,
};
use crate::sim::{generate_classification_data, generate_regression_data, SimArgs, SimOut};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModelType {
    /// y ~ N(xᵀθ, σ²), conjugate to a multivariate Gaussian
    LinearGaussian,
    /// y ~ Bernoulli(σ(xᵀθ))
    Logistic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PosteriorType {
    /// Full-covariance Gaussian
    Mvn,
    /// Diagonal Gaussian
    Mfg,
}

impl From<PosteriorType> for Family {
    fn from(p: PosteriorType) -> Self {
        match p {
            PosteriorType::Mvn => Family::MultivariateGaussian,
            PosteriorType::Mfg => Family::MeanFieldGaussian,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Sync,
    Async,
    Continual,
    BayesContinual,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(short, long, help = "JSON file with `client` and `server` settings")]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value = "linear-gaussian")]
    pub model: ModelType,

    #[arg(short, long, default_value = "mvn")]
    pub posterior: PosteriorType,

    #[arg(long, default_value = "1000")]
    pub rows: usize,

    #[arg(long, default_value = "2")]
    pub cols: usize,

    #[arg(long, default_value = "4")]
    pub clients: usize,

    #[arg(long, default_value = "1.0", help = "Gamma shape of partition sizes")]
    pub heterogeneity: f64,

    #[arg(long, default_value = "1.0")]
    pub noise_std: f64,

    #[arg(long, default_value = "1.0")]
    pub prior_var: f64,

    #[arg(long, help = "Append an intercept column")]
    pub bias: bool,

    #[arg(long, default_value = "42")]
    pub rseed: u64,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub max_iterations: Option<usize>,

    #[arg(long)]
    pub damping: Option<f64>,

    #[arg(long, help = "Show a progress bar for every local optimisation")]
    pub progress: bool,
}

impl RunArgs {
    /// JSON settings, if any, with command-line flags on top.
    pub fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                RunConfig::from_json_file(path)?
            }
            None => RunConfig::default(),
        };

        if let Some(epochs) = self.epochs {
            config.client.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.client.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.client.optimiser_params.lr = lr;
        }
        if self.max_iterations.is_some() {
            config.server.max_iterations = self.max_iterations;
        }
        if let Some(d) = self.damping {
            config.server.damping_factor = d;
        }
        config.client.show_progress |= self.progress;
        config.client.seed = self.rseed;
        config.server.seed = self.rseed;

        config.client.validate()?;
        config.server.validate()?;
        Ok(config)
    }

    fn sim_args(&self) -> SimArgs {
        SimArgs {
            rows: self.rows,
            cols: self.cols,
            clients: self.clients,
            heterogeneity: self.heterogeneity,
            noise_std: self.noise_std,
            rseed: self.rseed,
        }
    }
}

pub fn run(kind: ServerKind, args: &RunArgs) -> Result<()> {
    let config = args.run_config()?;
    let device = Device::Cpu;
    let family = Family::from(args.posterior);

    match args.model {
        ModelType::LinearGaussian => {
            let sim = generate_regression_data(&args.sim_args(), &device)?;
            let p = args.cols + usize::from(args.bias);
            let prior = isotropic_gaussian_prior(family, p, args.prior_var, &device)?;
            let make_model = || LinearGaussianModel::new(args.noise_std, args.bias, &device);
            let q = run_server(kind, &config, &prior, &sim, make_model, args.noise_std)?;
            report(&q, &sim)
        }
        ModelType::Logistic => {
            let sim = generate_classification_data(&args.sim_args(), &device)?;
            let model = LogisticRegressionModel::new(args.bias);
            let prior = model.prior(family, args.cols, args.prior_var, &device)?;
            let make_model = || Ok(LogisticRegressionModel::new(args.bias));
            let q = run_server(kind, &config, &prior, &sim, make_model, args.noise_std)?;
            report(&q, &sim)
        }
    }
}

/// Build one client per partition, run the server to completion and return
/// the final posterior.
fn run_server<M, F>(
    kind: ServerKind,
    config: &RunConfig,
    prior: &ExpFamDistribution,
    sim: &SimOut,
    make_model: F,
    noise_std: f64,
) -> Result<ExpFamDistribution>
where
    M: Model,
    F: Fn() -> crate::error::Result<M>,
{
    let partitions: &[Data] = &sim.partitions;
    info!(
        "{} clients with partition sizes {:?}",
        partitions.len(),
        partitions.iter().map(|d| d.len()).collect::<Vec<_>>()
    );

    let q = match kind {
        ServerKind::Sync | ServerKind::Async => {
            let mut clients = Vec::with_capacity(partitions.len());
            for (id, data) in partitions.iter().enumerate() {
                let t = ExpFamFactor::zero_like(prior)?;
                clients.push(PviClient::new(id, data.clone(), make_model()?, t, config.client.clone()));
            }
            if kind == ServerKind::Sync {
                let mut server = SynchronousServer::new(prior, clients, config.server.clone())?;
                server.run()?;
                server.q().non_trainable_copy()?
            } else {
                let mut server = AsynchronousServer::new(prior, clients, config.server.clone())?;
                server.run()?;
                info!("clients updated per round: {:?}", server.log().clients_updated);
                server.q().non_trainable_copy()?
            }
        }
        ServerKind::Continual => {
            let mut clients = Vec::with_capacity(partitions.len());
            for (id, data) in partitions.iter().enumerate() {
                clients.push(ContinualLearningClient::new(id, data.clone(), make_model()?, config.client.clone()));
            }
            let mut server = ContinualLearningServer::new(prior, clients, config.server.clone())?;
            server.run()?;
            server.q().non_trainable_copy()?
        }
        ServerKind::BayesContinual => {
            let mut clients = Vec::with_capacity(partitions.len());
            for (id, data) in partitions.iter().enumerate() {
                clients.push(BayesianContinualLearningClient::new(
                    id,
                    data.clone(),
                    make_model()?,
                    config.client.clone(),
                ));
            }
            let qeps = log_noise_prior(noise_std, &Device::Cpu)?;
            let mut server = BayesianContinualLearningServer::new(prior, &qeps, clients, config.server.clone())?;
            server.run()?;

            let eps = server.qeps().std_params()?;
            info!(
                "q(log σ): loc = {:?}, scale = {:?}",
                to_f64_vec(eps.get("loc")?)?,
                to_f64_vec(eps.get("scale")?)?
            );
            server.q().non_trainable_copy()?
        }
    };
    Ok(q)
}

/// `q(log σ) = N(log noise_std, 0.5²)`, one-dimensional.
fn log_noise_prior(noise_std: f64, device: &Device) -> Result<ExpFamDistribution> {
    let std = ParamDict::new()
        .with("loc", Tensor::new(&[noise_std.ln()], device)?)
        .with("scale", Tensor::new(&[0.5f64], device)?);
    Ok(ExpFamDistribution::from_std(Family::MeanFieldGaussian, std, false)?)
}

fn report(q: &ExpFamDistribution, sim: &SimOut) -> Result<()> {
    let loc = to_f64_vec(q.std_params()?.get("loc")?)?;
    info!("true θ: {:?}", sim.theta);
    info!("posterior mean: {:?}", loc);
    info!("posterior entropy: {:.4}", q.entropy()?);
    Ok(())
}
