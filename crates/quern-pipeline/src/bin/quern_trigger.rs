//! Revision trigger service binary.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::store::NodeStore;
use quern_pipeline::trigger::{GitRemote, TriggerService};

#[derive(Debug, Parser)]
#[command(name = "quern-trigger", about = "Watch source trees and create checkout nodes")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    /// Create checkout nodes even within the frequency window.
    #[arg(long)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk every build config once and exit.
    Run,
    /// Poll in a loop until terminated.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let trigger = TriggerService::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Arc::new(GitRemote),
        cli.force,
    );

    match cli.command {
        Command::Run => trigger.poll().await?,
        Command::Loop => {
            let shutdown = shutdown_on_signals();
            trigger.run(shutdown).await?;
        }
    }
    Ok(())
}
