use expfam_param::{ExpFamDistribution, ExpFamFactor, ParamDict};
use log::{debug, info, warn};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::client::{BayesianContinualLearningClient, ContinualLearningClient, PviClient};
use crate::config::ServerConfig;
use crate::error::{PviError, Result};
use crate::model::Model;

/// Default round budget of the synchronous and asynchronous servers.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Snapshot taken after an update of the global posterior.
#[derive(Debug)]
pub struct ServerLogEntry {
    /// Rounds completed when the snapshot was taken
    pub round: usize,
    pub q: ExpFamDistribution,
    /// Hyperparameter posterior, if the server learns one
    pub qeps: Option<ExpFamDistribution>,
    /// Cumulative client interactions
    pub communications: usize,
}

#[derive(Debug, Default)]
pub struct ServerLog {
    pub entries: Vec<ServerLogEntry>,
    /// Clients updated in each round (asynchronous server)
    pub clients_updated: Vec<usize>,
}

pub trait Server {
    /// Run one round. Returns whether another round should follow.
    fn tick(&mut self) -> Result<bool>;

    fn iterations(&self) -> usize;

    fn max_iterations(&self) -> usize;

    fn communications(&self) -> usize;

    /// Current global posterior.
    fn q(&self) -> &ExpFamDistribution;

    fn log(&self) -> &ServerLog;

    fn should_stop(&self) -> bool {
        self.iterations() >= self.max_iterations()
    }

    fn run(&mut self) -> Result<()> {
        while self.tick()? {}
        info!(
            "stopped after {} rounds, {} communications",
            self.iterations(),
            self.communications()
        );
        Ok(())
    }
}

/// State every server keeps: the posterior is always frozen and is
/// replaced, never mutated.
struct ServerCore {
    q: ExpFamDistribution,
    config: ServerConfig,
    max_iterations: usize,
    iterations: usize,
    communications: usize,
    log: ServerLog,
}

impl ServerCore {
    fn new(q: &ExpFamDistribution, config: ServerConfig, default_max: usize, num_clients: usize) -> Result<Self> {
        config.validate()?;
        if num_clients == 0 {
            return Err(PviError::Config("a server needs at least one client".into()));
        }
        let mut ret = Self {
            q: q.non_trainable_copy()?,
            max_iterations: config.max_iterations.unwrap_or(default_max),
            config,
            iterations: 0,
            communications: 0,
            log: ServerLog::default(),
        };
        ret.snapshot(None)?;
        Ok(ret)
    }

    fn snapshot(&mut self, qeps: Option<&ExpFamDistribution>) -> Result<()> {
        let qeps = match qeps {
            Some(d) => Some(d.non_trainable_copy()?),
            None => None,
        };
        self.log.entries.push(ServerLogEntry {
            round: self.iterations,
            q: self.q.non_trainable_copy()?,
            qeps,
            communications: self.communications,
        });
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.iterations >= self.max_iterations
    }
}

macro_rules! server_accessors {
    () => {
        fn iterations(&self) -> usize {
            self.core.iterations
        }

        fn max_iterations(&self) -> usize {
            self.core.max_iterations
        }

        fn communications(&self) -> usize {
            self.core.communications
        }

        fn q(&self) -> &ExpFamDistribution {
            &self.core.q
        }

        fn log(&self) -> &ServerLog {
            &self.core.log
        }
    };
}

/// `ν_t_new - ν_t_old`, key by key
fn factor_delta(t_old: &ExpFamFactor, t_new: &ExpFamFactor) -> Result<ParamDict> {
    Ok(t_new.nat_params().sub(t_old.nat_params())?)
}

/// Every available client refines against the same q; the deltas are
/// summed and applied once at the end of the round.
pub struct SynchronousServer<M: Model> {
    core: ServerCore,
    clients: Vec<PviClient<M>>,
}

impl<M: Model> SynchronousServer<M> {
    pub fn new(q: &ExpFamDistribution, clients: Vec<PviClient<M>>, config: ServerConfig) -> Result<Self> {
        Ok(Self {
            core: ServerCore::new(q, config, DEFAULT_MAX_ITERATIONS, clients.len())?,
            clients,
        })
    }

    pub fn clients(&self) -> &[PviClient<M>] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [PviClient<M>] {
        &mut self.clients
    }
}

impl<M: Model> Server for SynchronousServer<M> {
    server_accessors!();

    fn tick(&mut self) -> Result<bool> {
        if self.should_stop() {
            return Ok(false);
        }
        debug!("round {}: getting client updates", self.core.iterations);

        let q = &self.core.q;
        let mut refined = Vec::with_capacity(self.clients.len());
        for (i, client) in self.clients.iter_mut().enumerate() {
            if !client.can_update() {
                warn!("skipping client {}, not available", client.id());
                continue;
            }
            let t_old = client.factor().clone();
            let (_, t_new) = client.refine(q)?;
            refined.push((i, t_old, t_new));
        }

        let mut nat = q.nat_params()?;
        for (_, t_old, t_new) in refined.iter() {
            nat = nat.add(&factor_delta(t_old, t_new)?)?;
        }
        self.core.q = q.with_nat_params(nat)?;

        let num_updated = refined.len();
        for (i, _, t_new) in refined {
            self.clients[i].commit(t_new);
        }

        self.core.communications += num_updated;
        self.core.iterations += 1;
        self.core.log.clients_updated.push(num_updated);
        self.core.snapshot(None)?;

        info!(
            "round {} complete: {} clients updated",
            self.core.iterations, num_updated
        );
        Ok(!self.should_stop())
    }
}

/// Visit order of one asynchronous round: every client once, drawn
/// without replacement with probability ∝ `weights`.
pub fn weighted_order(weights: &[f64], rng: &mut StdRng) -> Result<Vec<usize>> {
    let mut remaining = (0..weights.len()).collect::<Vec<_>>();
    let mut order = Vec::with_capacity(weights.len());
    while !remaining.is_empty() {
        let w = remaining.iter().map(|&i| weights[i]).collect::<Vec<_>>();
        let widx = WeightedIndex::new(&w)
            .map_err(|e| PviError::Config(format!("client selection weights: {}", e)))?;
        order.push(remaining.remove(widx.sample(rng)));
    }
    Ok(order)
}

/// Clients are visited one at a time, smaller partitions first in
/// expectation, and each damped delta is applied immediately.
pub struct AsynchronousServer<M: Model> {
    core: ServerCore,
    clients: Vec<PviClient<M>>,
    client_probs: Vec<f64>,
    exhausted: bool,
    rng: StdRng,
}

impl<M: Model> AsynchronousServer<M> {
    pub fn new(q: &ExpFamDistribution, clients: Vec<PviClient<M>>, config: ServerConfig) -> Result<Self> {
        let inv = clients
            .iter()
            .map(|c| 1.0 / c.data().len().max(1) as f64)
            .collect::<Vec<_>>();
        let tot: f64 = inv.iter().sum();
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            core: ServerCore::new(q, config, DEFAULT_MAX_ITERATIONS, clients.len())?,
            client_probs: inv.into_iter().map(|p| p / tot).collect(),
            clients,
            exhausted: false,
            rng,
        })
    }

    pub fn client_probs(&self) -> &[f64] {
        &self.client_probs
    }

    pub fn clients(&self) -> &[PviClient<M>] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [PviClient<M>] {
        &mut self.clients
    }

    /// Visit clients in the given order instead of a sampled one.
    pub fn tick_with_order(&mut self, order: &[usize]) -> Result<bool> {
        if self.should_stop() {
            return Ok(false);
        }
        debug!("round {}: getting client updates", self.core.iterations);

        let damping = self.core.config.damping_factor;
        let mut clients_updated = 0;

        for &i in order {
            if !self.clients.iter().any(|c| c.can_update()) {
                info!("all clients report to be finished, ending the round");
                if self.core.config.stop_when_exhausted {
                    self.exhausted = true;
                }
                break;
            }

            let client = self
                .clients
                .get_mut(i)
                .ok_or_else(|| PviError::Config(format!("no client with index {}", i)))?;

            if !client.can_update() {
                debug!("skipping client {}, not available to update", client.id());
                continue;
            }

            let t_old = client.factor().clone();
            let t_new = client.fit(&self.core.q)?;
            let delta = factor_delta(&t_old, &t_new)?;

            let nat = self.core.q.nat_params()?.add_scaled(&delta, damping)?;
            self.core.q = self.core.q.with_nat_params(nat)?;

            clients_updated += 1;
            self.core.communications += 1;
            self.core.snapshot(None)?;
        }

        self.core.iterations += 1;
        self.core.log.clients_updated.push(clients_updated);
        info!(
            "round {} complete: {} clients updated",
            self.core.iterations, clients_updated
        );
        Ok(!self.should_stop())
    }
}

impl<M: Model> Server for AsynchronousServer<M> {
    server_accessors!();

    fn should_stop(&self) -> bool {
        self.exhausted || self.core.should_stop()
    }

    fn tick(&mut self) -> Result<bool> {
        if self.should_stop() {
            return Ok(false);
        }
        let order = weighted_order(&self.client_probs, &mut self.rng)?;
        self.tick_with_order(&order)
    }
}

/// One client per round, round-robin; the returned posterior replaces q.
pub struct ContinualLearningServer<M: Model> {
    core: ServerCore,
    clients: Vec<ContinualLearningClient<M>>,
    client_idx: usize,
}

impl<M: Model> ContinualLearningServer<M> {
    /// Unless configured, every client is visited exactly once.
    pub fn new(
        q: &ExpFamDistribution,
        clients: Vec<ContinualLearningClient<M>>,
        config: ServerConfig,
    ) -> Result<Self> {
        Ok(Self {
            core: ServerCore::new(q, config, clients.len(), clients.len())?,
            clients,
            client_idx: 0,
        })
    }

    pub fn clients(&self) -> &[ContinualLearningClient<M>] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [ContinualLearningClient<M>] {
        &mut self.clients
    }
}

impl<M: Model> Server for ContinualLearningServer<M> {
    server_accessors!();

    fn tick(&mut self) -> Result<bool> {
        if self.should_stop() {
            return Ok(false);
        }

        let client = &mut self.clients[self.client_idx];
        if client.can_update() {
            debug!("round {}: client {}", self.core.iterations, client.id());
            self.core.q = client.fit(&self.core.q)?.non_trainable_copy()?;
            self.core.communications += 1;
            self.core.snapshot(None)?;
        } else {
            warn!("skipping client {}, not available", client.id());
        }

        self.core.iterations += 1;
        self.client_idx = (self.client_idx + 1) % self.clients.len();
        Ok(!self.should_stop())
    }
}

/// Continual learning of `q(θ)` and a hyperparameter posterior `q(ε)`.
pub struct BayesianContinualLearningServer<M: Model> {
    core: ServerCore,
    qeps: ExpFamDistribution,
    clients: Vec<BayesianContinualLearningClient<M>>,
    client_idx: usize,
}

impl<M: Model> BayesianContinualLearningServer<M> {
    pub fn new(
        q: &ExpFamDistribution,
        qeps: &ExpFamDistribution,
        clients: Vec<BayesianContinualLearningClient<M>>,
        config: ServerConfig,
    ) -> Result<Self> {
        let qeps = qeps.non_trainable_copy()?;
        let mut core = ServerCore::new(q, config, clients.len(), clients.len())?;
        core.log.entries.clear();
        core.snapshot(Some(&qeps))?;
        Ok(Self {
            core,
            qeps,
            clients,
            client_idx: 0,
        })
    }

    pub fn qeps(&self) -> &ExpFamDistribution {
        &self.qeps
    }

    pub fn clients(&self) -> &[BayesianContinualLearningClient<M>] {
        &self.clients
    }
}

impl<M: Model> Server for BayesianContinualLearningServer<M> {
    server_accessors!();

    fn tick(&mut self) -> Result<bool> {
        if self.should_stop() {
            return Ok(false);
        }

        let client = &mut self.clients[self.client_idx];
        if client.can_update() {
            debug!("round {}: client {}", self.core.iterations, client.id());
            let (q_new, qeps_new) = client.fit(&self.core.q, &self.qeps)?;
            self.core.q = q_new;
            self.qeps = qeps_new;
            self.core.communications += 1;
            self.core.snapshot(Some(&self.qeps))?;
        } else {
            warn!("skipping client {}, not available", client.id());
        }

        self.core.iterations += 1;
        self.client_idx = (self.client_idx + 1) % self.clients.len();
        Ok(!self.should_stop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_order_is_a_permutation() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let mut order = weighted_order(&[0.5, 0.1, 0.3, 0.1], &mut rng)?;
        order.sort();
        assert_eq!(order, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn heavier_clients_tend_to_come_first() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let first_is_heavy = (0..500)
            .map(|_| weighted_order(&[0.9, 0.1], &mut rng))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .filter(|o| o[0] == 0)
            .count();
        assert!(first_is_heavy > 400);
        Ok(())
    }
}
