use candle_core::{Tensor, Var};
use expfam_param::tensor_util::{scalar_f64, to_f64_vec};
use expfam_param::{ExpFamDistribution, ExpFamFactor};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ClientConfig;
use crate::data::Data;
use crate::error::{PviError, Result};
use crate::model::{monte_carlo_expected_log_likelihood, Model};
use crate::optimiser::LocalOptimiser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Optimising,
}

/// Per-epoch sums over mini-batches for one local update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingCurve {
    pub elbo: Vec<f64>,
    pub kl: Vec<f64>,
    pub ll: Vec<f64>,
    /// Only for clients with a hyperparameter posterior
    pub kleps: Option<Vec<f64>>,
}

impl TrainingCurve {
    pub fn num_epochs(&self) -> usize {
        self.elbo.len()
    }
}

/// One `TrainingCurve` per gradient-based update, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ClientLog {
    pub training_curves: Vec<TrainingCurve>,
}

/// Loss of one mini-batch together with the scalars that are logged.
pub(crate) struct BatchTerms {
    loss: Tensor,
    kl: f64,
    ll: f64,
    kleps: Option<f64>,
}

impl BatchTerms {
    /// `loss = kl + kleps - ll`
    fn new(kl: Tensor, ll: Tensor, kleps: Option<Tensor>) -> Result<Self> {
        let mut loss = (&kl - &ll)?;
        let kleps = match kleps {
            Some(k) => {
                loss = (loss + &k)?;
                Some(scalar_f64(&k)?)
            }
            None => None,
        };
        Ok(Self {
            kl: scalar_f64(&kl)?,
            ll: scalar_f64(&ll)?,
            kleps,
            loss,
        })
    }
}

/// Epochs × shuffled mini-batches with a freshly reset optimiser over
/// `vars`. `batch_terms` builds the loss of each batch; `with_kleps`
/// gives the curve a `kleps` trace even when no epoch runs.
pub(crate) fn optimise<F>(
    client_id: usize,
    data: &Data,
    config: &ClientConfig,
    rng: &mut StdRng,
    vars: Vec<Var>,
    with_kleps: bool,
    mut batch_terms: F,
) -> Result<TrainingCurve>
where
    F: FnMut(&Data, &mut StdRng) -> Result<BatchTerms>,
{
    config.validate()?;
    let kind = config.optimiser_kind()?;
    debug!("client {}: resetting optimiser ({:?})", client_id, kind);
    let mut opt = LocalOptimiser::new(kind, &config.optimiser_params, vars)?;

    let pb = ProgressBar::new(config.epochs as u64);
    if !config.show_progress {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut curve = TrainingCurve {
        kleps: with_kleps.then(Vec::new),
        ..Default::default()
    };

    for epoch in 0..config.epochs {
        let (mut elbo, mut kl, mut ll, mut kleps) = (0_f64, 0_f64, 0_f64, None::<f64>);

        for batch in data.minibatches(config.batch_size, rng)? {
            let terms = batch_terms(&batch, rng)?;
            opt.backward_step(&terms.loss)?;

            elbo -= scalar_f64(&terms.loss)?;
            kl += terms.kl;
            ll += terms.ll;
            if let Some(k) = terms.kleps {
                *kleps.get_or_insert(0.0) += k;
            }
        }

        curve.elbo.push(elbo);
        curve.kl.push(kl);
        curve.ll.push(ll);
        if let Some(trace) = curve.kleps.as_mut() {
            trace.push(kleps.unwrap_or(0.0));
        }
        pb.inc(1);

        if epoch % config.print_epochs == 0 {
            match kleps {
                Some(k) => debug!(
                    "client {} [{}] ELBO: {:.3}, LL: {:.3}, KL: {:.3}, KL eps: {:.3}",
                    client_id, epoch, elbo, ll, kl, k
                ),
                None => debug!(
                    "client {} [{}] ELBO: {:.3}, LL: {:.3}, KL: {:.3}",
                    client_id, epoch, elbo, ll, kl
                ),
            }
        }
    }
    pb.finish_and_clear();
    Ok(curve)
}

/// Refuse if either side carries reference locations the other does not
/// share exactly.
fn check_inducing_locations(t: &ExpFamFactor, q: &ExpFamDistribution) -> Result<()> {
    match (t.inducing_locations(), q.inducing_locations()) {
        (None, None) => Ok(()),
        (Some(zt), Some(zq)) => {
            if zt.dims() != zq.dims() {
                return Err(PviError::Consistency(format!(
                    "inducing locations have shape {:?} in the factor but {:?} in q",
                    zt.dims(),
                    zq.dims()
                )));
            }
            let diff = to_f64_vec(zt)?
                .iter()
                .zip(to_f64_vec(zq)?.iter())
                .fold(0_f64, |acc, (a, b)| acc.max((a - b).abs()));
            if diff > 0.0 {
                return Err(PviError::Consistency(format!(
                    "inducing locations moved by {:e} since the last round",
                    diff
                )));
            }
            Ok(())
        }
        _ => Err(PviError::Consistency(
            "inducing locations present on only one of factor and q".into(),
        )),
    }
}

/// Shared state of every client variant.
struct ClientCore<M: Model> {
    id: usize,
    data: Data,
    model: M,
    config: ClientConfig,
    state: ClientState,
    log: ClientLog,
    rng: StdRng,
}

impl<M: Model> ClientCore<M> {
    fn new(id: usize, data: Data, model: M, config: ClientConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(id as u64));
        Self {
            id,
            data,
            model,
            config,
            state: ClientState::Idle,
            log: ClientLog::default(),
            rng,
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.state == ClientState::Optimising {
            return Err(PviError::ClientBusy(self.id));
        }
        self.state = ClientState::Optimising;
        Ok(())
    }

    /// Back to `Idle` whatever the outcome.
    fn end<T>(&mut self, ret: Result<T>) -> Result<T> {
        self.state = ClientState::Idle;
        ret
    }

    /// Variables of one gradient update: q's, plus the model's if asked.
    fn variables(&self, q: &ExpFamDistribution) -> Vec<Var> {
        let mut vars = q.parameters();
        if self.config.train_model {
            vars.extend(self.model.trainable_variables());
        }
        vars
    }

    fn is_conjugate(&self, q: &ExpFamDistribution) -> bool {
        self.model.conjugate_family() == Some(q.family())
    }
}

macro_rules! client_accessors {
    () => {
        pub fn id(&self) -> usize {
            self.core.id
        }

        pub fn data(&self) -> &Data {
            &self.core.data
        }

        pub fn model(&self) -> &M {
            &self.core.model
        }

        pub fn model_mut(&mut self) -> &mut M {
            &mut self.core.model
        }

        pub fn config(&self) -> &ClientConfig {
            &self.core.config
        }

        pub fn state(&self) -> ClientState {
            self.core.state
        }

        /// Servers only hand work to clients that can update.
        pub fn can_update(&self) -> bool {
            self.core.state == ClientState::Idle
        }

        /// Mark the client busy or idle from outside, e.g. when its
        /// optimisation is running elsewhere.
        pub fn set_state(&mut self, state: ClientState) {
            self.core.state = state;
        }

        pub fn log(&self) -> &ClientLog {
            &self.core.log
        }
    };
}

/// A PVI client: owns a data partition and the factor `t_i` it has
/// published to the server.
pub struct PviClient<M: Model> {
    core: ClientCore<M>,
    t: ExpFamFactor,
}

impl<M: Model> PviClient<M> {
    pub fn new(id: usize, data: Data, model: M, t: ExpFamFactor, config: ClientConfig) -> Self {
        Self {
            core: ClientCore::new(id, data, model, config),
            t,
        }
    }

    client_accessors!();

    /// The factor currently published.
    pub fn factor(&self) -> &ExpFamFactor {
        &self.t
    }

    /// Refine against `q` without publishing: returns the refined
    /// posterior and factor, leaving `factor()` unchanged.
    pub fn refine(&mut self, q: &ExpFamDistribution) -> Result<(ExpFamDistribution, ExpFamFactor)> {
        self.core.begin()?;
        let ret = self.update_q(q);
        self.core.end(ret)
    }

    /// Publish a refined factor.
    pub fn commit(&mut self, t: ExpFamFactor) {
        self.t = t;
    }

    /// Refine and publish; returns the new factor.
    pub fn fit(&mut self, q: &ExpFamDistribution) -> Result<ExpFamFactor> {
        let (_, t_new) = self.refine(q)?;
        self.commit(t_new.clone());
        Ok(t_new)
    }

    fn update_q(&mut self, q: &ExpFamDistribution) -> Result<(ExpFamDistribution, ExpFamFactor)> {
        if self.core.is_conjugate(q) {
            debug!("client {}: conjugate update", self.core.id);
            return self
                .core
                .model
                .conjugate_update(&self.core.data, q, Some(&self.t));
        }
        self.gradient_based_update(q)
    }

    fn gradient_based_update(
        &mut self,
        q: &ExpFamDistribution,
    ) -> Result<(ExpFamDistribution, ExpFamFactor)> {
        check_inducing_locations(&self.t, q)?;

        let q_old = q.non_trainable_copy()?;
        let q_new = q.trainable_copy()?;
        let vars = self.core.variables(&q_new);

        let ClientCore {
            id,
            data,
            model,
            config,
            rng,
            log,
            ..
        } = &mut self.core;
        let t = &self.t;
        let n = data.len() as f64;
        let num_samples = config.num_elbo_samples;

        let curve = optimise(*id, data, config, rng, vars, false, |batch, rng| {
            let kl = (q_new.kl_divergence(&q_old)? / n)?;
            let ll = (model.expected_log_likelihood(batch, &q_new, num_samples, rng)?
                / batch.len() as f64)?;
            let ll = (ll - (t.eq_log_t(&q_new)? / n)?)?;
            BatchTerms::new(kl, ll, None)
        })?;
        log.training_curves.push(curve);

        let t_new = self.t.compute_refined_factor(&q_new, &q_old)?;
        Ok((q_new.non_trainable_copy()?, t_new))
    }
}

/// A continual-learning client: the incoming posterior is its prior, and
/// it returns a posterior rather than a factor.
pub struct ContinualLearningClient<M: Model> {
    core: ClientCore<M>,
}

impl<M: Model> ContinualLearningClient<M> {
    pub fn new(id: usize, data: Data, model: M, config: ClientConfig) -> Self {
        Self {
            core: ClientCore::new(id, data, model, config),
        }
    }

    client_accessors!();

    pub fn fit(&mut self, q: &ExpFamDistribution) -> Result<ExpFamDistribution> {
        self.core.begin()?;
        let ret = self.update_q(q);
        self.core.end(ret)
    }

    fn update_q(&mut self, q: &ExpFamDistribution) -> Result<ExpFamDistribution> {
        if self.core.is_conjugate(q) {
            debug!("client {}: conjugate update", self.core.id);
            let (q_new, _) = self.core.model.conjugate_update(&self.core.data, q, None)?;
            return Ok(q_new);
        }

        let p = q.non_trainable_copy()?;
        let q_new = q.trainable_copy()?;
        let vars = self.core.variables(&q_new);

        let ClientCore {
            id,
            data,
            model,
            config,
            rng,
            log,
            ..
        } = &mut self.core;
        let n = data.len() as f64;
        let num_samples = config.num_elbo_samples;

        let curve = optimise(*id, data, config, rng, vars, false, |batch, rng| {
            let kl = (q_new.kl_divergence(&p)? / n)?;
            let ll = (model.expected_log_likelihood(batch, &q_new, num_samples, rng)?
                / batch.len() as f64)?;
            BatchTerms::new(kl, ll, None)
        })?;
        log.training_curves.push(curve);

        Ok(q_new.non_trainable_copy()?)
    }
}

/// Continual learning with a posterior `q(ε)` over model hyperparameters,
/// learnt jointly with `q(θ)` under a mean-field `q(θ) q(ε)`.
pub struct BayesianContinualLearningClient<M: Model> {
    core: ClientCore<M>,
}

impl<M: Model> BayesianContinualLearningClient<M> {
    pub fn new(id: usize, data: Data, model: M, config: ClientConfig) -> Self {
        Self {
            core: ClientCore::new(id, data, model, config),
        }
    }

    client_accessors!();

    pub fn fit(
        &mut self,
        q: &ExpFamDistribution,
        qeps: &ExpFamDistribution,
    ) -> Result<(ExpFamDistribution, ExpFamDistribution)> {
        self.core.begin()?;
        let ret = self.gradient_based_update(q, qeps);
        self.core.end(ret)
    }

    fn gradient_based_update(
        &mut self,
        q: &ExpFamDistribution,
        qeps: &ExpFamDistribution,
    ) -> Result<(ExpFamDistribution, ExpFamDistribution)> {
        let p = q.non_trainable_copy()?;
        let peps = qeps.non_trainable_copy()?;
        let q_new = q.trainable_copy()?;
        let qeps_new = qeps.trainable_copy()?;

        let mut vars = self.core.variables(&q_new);
        vars.extend(qeps_new.parameters());

        let conjugate = self.core.is_conjugate(q);
        let ClientCore {
            id,
            data,
            model,
            config,
            rng,
            log,
            ..
        } = &mut self.core;
        let n = data.len() as f64;
        let num_hyper = config.num_elbo_hyper_samples;
        let num_theta = config.num_elbo_theta_samples;

        let curve = optimise(*id, data, config, rng, vars, true, |batch, rng| {
            let kl = (q_new.kl_divergence(&p)? / n)?;
            let kleps = (qeps_new.kl_divergence(&peps)? / n)?;

            let mut ll_sum: Option<Tensor> = None;
            for _ in 0..num_hyper {
                let eps = qeps_new.rsample(1, rng)?.squeeze(0)?;
                model.set_hyperparameters(&eps)?;
                let ll = if conjugate {
                    model.expected_log_likelihood(batch, &q_new, num_theta, rng)?
                } else {
                    monte_carlo_expected_log_likelihood(&*model, batch, &q_new, num_theta, rng)?
                };
                ll_sum = Some(match ll_sum {
                    Some(acc) => (acc + ll)?,
                    None => ll,
                });
            }
            let ll = ll_sum.ok_or(PviError::Config(
                "num_elbo_hyper_samples must be at least 1".into(),
            ))?;
            let ll = (ll / (num_hyper * batch.len()) as f64)?;
            BatchTerms::new(kl, ll, Some(kleps))
        })?;
        log.training_curves.push(curve);

        info!(
            "client {}: updated q(θ) and q(ε) after {} epochs",
            self.core.id, self.core.config.epochs
        );
        Ok((q_new.non_trainable_copy()?, qeps_new.non_trainable_copy()?))
    }
}
