pub mod run;

use clap::{Parser, Subcommand};

pub use run::{ModelType, PosteriorType, RunArgs};

#[derive(Parser)]
#[command(name = "pvi")]
#[command(about = "Partitioned variational inference on simulated client partitions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// All clients refine against the same posterior each round
    Sync(RunArgs),
    /// Clients update one at a time, with damping
    Async(RunArgs),
    /// Sequential posterior passing, one client per round
    Continual(RunArgs),
    /// Continual learning with a posterior over the log noise scale
    BayesContinual(RunArgs),
}
