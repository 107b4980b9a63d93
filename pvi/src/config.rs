//! Client and server hyperparameters.
//!
//! Every field has a default, so a JSON file only needs to list the
//! values it changes, e.g.
//!
//! ```json
//! { "client": { "epochs": 200, "optimiser_params": { "lr": 0.01 } },
//!   "server": { "max_iterations": 5, "damping_factor": 0.5 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PviError, Result};
use crate::optimiser::OptimiserKind;

/// Numeric settings of the local update rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiserParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for OptimiserParams {
    fn default() -> Self {
        Self {
            lr: 0.05,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// How a client refines its local factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `Adam`, `AdamW` or `SGD`
    pub optimiser: String,
    pub optimiser_params: OptimiserParams,
    pub batch_size: usize,
    pub epochs: usize,
    /// θ draws per mini-batch for the expected log-likelihood
    pub num_elbo_samples: usize,
    /// ε draws per mini-batch (Bayesian hyperparameter clients)
    pub num_elbo_hyper_samples: usize,
    /// θ draws per ε draw (Bayesian hyperparameter clients)
    pub num_elbo_theta_samples: usize,
    pub print_epochs: usize,
    /// Optimise the model's own variables jointly with q
    pub train_model: bool,
    pub show_progress: bool,
    pub seed: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            optimiser: "Adam".to_string(),
            optimiser_params: OptimiserParams::default(),
            batch_size: 100,
            epochs: 100,
            num_elbo_samples: 10,
            num_elbo_hyper_samples: 1,
            num_elbo_theta_samples: 1,
            print_epochs: 10,
            train_model: false,
            show_progress: false,
            seed: 0,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ret: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn optimiser_kind(&self) -> Result<OptimiserKind> {
        self.optimiser.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.optimiser_kind()?;

        let p = &self.optimiser_params;
        if !(p.lr.is_finite() && p.lr > 0.0) {
            return Err(PviError::Config(format!("learning rate must be positive, got {}", p.lr)));
        }
        if !(0.0..1.0).contains(&p.beta1) || !(0.0..1.0).contains(&p.beta2) {
            return Err(PviError::Config(format!(
                "betas must lie in [0, 1), got ({}, {})",
                p.beta1, p.beta2
            )));
        }
        if p.eps <= 0.0 || p.weight_decay < 0.0 {
            return Err(PviError::Config("eps must be positive and weight_decay non-negative".into()));
        }

        for (name, value) in [
            ("batch_size", self.batch_size),
            ("num_elbo_samples", self.num_elbo_samples),
            ("num_elbo_hyper_samples", self.num_elbo_hyper_samples),
            ("num_elbo_theta_samples", self.num_elbo_theta_samples),
            ("print_epochs", self.print_epochs),
        ] {
            if value == 0 {
                return Err(PviError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}

/// Round budget and aggregation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Round budget. Unset means the server's own default.
    pub max_iterations: Option<usize>,
    /// Fraction of each client delta applied, in (0, 1]
    pub damping_factor: f64,
    /// Asynchronous server: end the whole run, not just the round, once no
    /// client is available.
    pub stop_when_exhausted: bool,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            damping_factor: 1.0,
            stop_when_exhausted: false,
            seed: 0,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ret: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn validate(&self) -> Result<()> {
        let d = self.damping_factor;
        if !(d > 0.0 && d <= 1.0) {
            return Err(PviError::Config(format!("damping_factor must lie in (0, 1], got {}", d)));
        }
        Ok(())
    }
}

/// Client and server settings of one experiment, as read by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ret: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        ret.client.validate()?;
        ret.server.validate()?;
        Ok(ret)
    }
}
