//! Regression tracker binary.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quern_pipeline::bus::EventBus;
use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::regression::RegressionService;
use quern_pipeline::store::NodeStore;

#[derive(Debug, Parser)]
#[command(name = "quern-regression", about = "Record pass-to-fail transitions")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for terminal failures until terminated.
    Run,
    /// Alias of `run`; the service is event-driven.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let tracker = RegressionService::new(
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Arc::clone(&ctx.store) as Arc<dyn EventBus>,
    );

    match cli.command {
        Command::Run | Command::Loop => {
            let shutdown = shutdown_on_signals();
            tracker.run(shutdown).await?;
        }
    }
    Ok(())
}
