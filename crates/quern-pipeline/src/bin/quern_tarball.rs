//! Tarball service binary.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use quern_pipeline::blob::http::HttpBlobStore;
use quern_pipeline::blob::BlobStore;
use quern_pipeline::bus::EventBus;
use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::store::NodeStore;
use quern_pipeline::tarball::{GitMirror, TarballService};

#[derive(Debug, Parser)]
#[command(name = "quern-tarball", about = "Publish source tarballs for new checkouts")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for checkout events until terminated.
    Run,
    /// Alias of `run`; the service is event-driven.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let blobs = Arc::new(HttpBlobStore::new(
        &ctx.config.storage,
        std::env::var("QUERN_STORAGE_TOKEN").ok(),
    )?);
    let mirror = Arc::new(GitMirror::new(
        ctx.config.tarball.kdir.clone(),
        ctx.config.tarball.output.clone(),
    ));

    let tarball = TarballService::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Arc::clone(&ctx.store) as Arc<dyn EventBus>,
        blobs as Arc<dyn BlobStore>,
        mirror,
    );

    match cli.command {
        Command::Run | Command::Loop => {
            let shutdown = shutdown_on_signals();
            tarball.run(shutdown).await?;
        }
    }
    Ok(())
}
