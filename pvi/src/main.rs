use anyhow::Result;
use clap::Parser;
use pvi::cli::run::{run, ServerKind};
use pvi::cli::{Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Sync(args) => {
            run(ServerKind::Sync, args)?;
        }
        Commands::Async(args) => {
            run(ServerKind::Async, args)?;
        }
        Commands::Continual(args) => {
            run(ServerKind::Continual, args)?;
        }
        Commands::BayesContinual(args) => {
            run(ServerKind::BayesContinual, args)?;
        }
    }

    Ok(())
}
