//! Timeout/holdoff reconciler binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::reconcile::ReconcilerService;
use quern_pipeline::store::NodeStore;

#[derive(Debug, Parser)]
#[command(name = "quern-timeout", about = "Expire stale nodes and close finished parents")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform a single sweep and exit.
    Run,
    /// Sweep periodically until terminated.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let reconciler = ReconcilerService::new(
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Duration::from_secs(ctx.config.timeout.poll_period_secs),
    );

    match cli.command {
        Command::Run => {
            let summary = reconciler.sweep().await?;
            tracing::info!(
                expired = summary.expired,
                completed = summary.completed,
                closing = summary.closing,
                "sweep finished"
            );
        }
        Command::Loop => {
            let shutdown = shutdown_on_signals();
            reconciler.run(shutdown).await?;
        }
    }
    Ok(())
}
