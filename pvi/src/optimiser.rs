use std::str::FromStr;

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::OptimiserParams;
use crate::error::{PviError, Result};

/// Local update rules accepted in `ClientConfig::optimiser`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimiserKind {
    /// AdamW with the weight decay forced to zero
    Adam,
    AdamW,
    Sgd,
}

impl FromStr for OptimiserKind {
    type Err = PviError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adam" => Ok(OptimiserKind::Adam),
            "adamw" => Ok(OptimiserKind::AdamW),
            "sgd" => Ok(OptimiserKind::Sgd),
            _ => Err(PviError::Config(format!("unknown optimiser '{}'", s))),
        }
    }
}

/// A freshly reset optimiser over the variables of one local update.
pub enum LocalOptimiser {
    AdamW(AdamW),
    Sgd(SGD),
}

impl LocalOptimiser {
    pub fn new(kind: OptimiserKind, params: &OptimiserParams, vars: Vec<Var>) -> Result<Self> {
        let adam_params = |weight_decay: f64| ParamsAdamW {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay,
        };

        Ok(match kind {
            OptimiserKind::Adam => LocalOptimiser::AdamW(AdamW::new(vars, adam_params(0.0))?),
            OptimiserKind::AdamW => {
                LocalOptimiser::AdamW(AdamW::new(vars, adam_params(params.weight_decay))?)
            }
            OptimiserKind::Sgd => LocalOptimiser::Sgd(SGD::new(vars, params.lr)?),
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            LocalOptimiser::AdamW(opt) => opt.backward_step(loss)?,
            LocalOptimiser::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }
}
