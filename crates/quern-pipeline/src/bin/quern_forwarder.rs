//! Result forwarder binary.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quern_pipeline::bus::EventBus;
use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::forward::{ForwarderService, HttpReportSink, ReportSink};
use quern_pipeline::store::NodeStore;

#[derive(Debug, Parser)]
#[command(name = "quern-forwarder", about = "Forward terminal nodes to the reporting sink")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Forward one settled batch and exit.
    Run,
    /// Forward event-driven with periodic batch sweeps until terminated.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let sink = Arc::new(HttpReportSink::new(
        &ctx.config.reporting,
        ctx.secrets.reporting.token.clone(),
    )?);

    let forwarder = ForwarderService::new(
        ctx.config.reporting.clone(),
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Arc::clone(&ctx.store) as Arc<dyn EventBus>,
        sink as Arc<dyn ReportSink>,
    );

    match cli.command {
        Command::Run => {
            let forwarded = forwarder.batch().await?;
            tracing::info!(forwarded, "batch finished");
        }
        Command::Loop => {
            let shutdown = shutdown_on_signals();
            forwarder.run(shutdown).await?;
        }
    }
    Ok(())
}
