//! Partitioned variational inference.
//!
//! A global exponential-family posterior `q(θ) ∝ p(θ) Π_i t_i(θ)` is refined
//! by clients that each own one data partition and one factor `t_i`.
//! Servers decide who refines when and fold the returned natural-parameter
//! deltas back into `q`.

pub mod cli;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod models;
pub mod optimiser;
pub mod server;
pub mod sim;

pub use client::{
    BayesianContinualLearningClient, ClientLog, ClientState, ContinualLearningClient, PviClient,
    TrainingCurve,
};
pub use config::{ClientConfig, OptimiserParams, RunConfig, ServerConfig};
pub use data::Data;
pub use error::{PviError, Result};
pub use model::Model;
pub use server::{
    AsynchronousServer, BayesianContinualLearningServer, ContinualLearningServer, Server,
    ServerLog, ServerLogEntry, SynchronousServer,
};

pub use expfam_param;
