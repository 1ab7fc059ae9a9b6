//! Scheduler service binary.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use quern_core::config::RuntimeKind;
use quern_pipeline::blob::http::HttpBlobStore;
use quern_pipeline::blob::BlobStore;
use quern_pipeline::bus::EventBus;
use quern_pipeline::cli::{shutdown_on_signals, ServiceArgs};
use quern_pipeline::runtime::docker::DockerRuntime;
use quern_pipeline::runtime::kubernetes::KubernetesRuntime;
use quern_pipeline::runtime::lava::LavaRuntime;
use quern_pipeline::runtime::pull::PullRuntime;
use quern_pipeline::runtime::shell::ShellRuntime;
use quern_pipeline::runtime::{ParamRenderer, Runtime};
use quern_pipeline::scheduler::SchedulerService;
use quern_pipeline::store::NodeStore;

#[derive(Debug, Parser)]
#[command(name = "quern-scheduler", about = "Match node events to jobs and dispatch them")]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    /// Runtimes to load, comma separated. All configured runtimes by
    /// default.
    #[arg(long, value_delimiter = ',')]
    runtimes: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for node events until terminated.
    Run,
    /// Alias of `run`; the service is event-driven.
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = cli.service.init()?;

    let blobs: Arc<dyn BlobStore> = Arc::new(HttpBlobStore::new(
        &ctx.config.storage,
        std::env::var("QUERN_STORAGE_TOKEN").ok(),
    )?);

    let mut adapters: Vec<Arc<dyn Runtime>> = Vec::new();
    for (name, runtime) in &ctx.config.runtimes {
        if !cli.runtimes.is_empty() && !cli.runtimes.iter().any(|r| r == name) {
            continue;
        }
        let token = ctx
            .secrets
            .runtimes
            .get(name)
            .and_then(|s| s.runtime_token.clone());

        let adapter: Arc<dyn Runtime> = match runtime.lab_type {
            RuntimeKind::Shell => Arc::new(ShellRuntime::new(name.clone(), Arc::clone(&blobs))),
            RuntimeKind::Docker => {
                let Some(image) = runtime.image.clone() else {
                    bail!("docker runtime '{name}' requires an image");
                };
                Arc::new(DockerRuntime::new(name.clone(), image, Arc::clone(&blobs)))
            }
            RuntimeKind::Kubernetes => Arc::new(KubernetesRuntime::new(
                name.clone(),
                runtime,
                token,
                Arc::clone(&blobs),
            )?),
            RuntimeKind::Lava => Arc::new(LavaRuntime::new(name.clone(), runtime, token)?),
            RuntimeKind::Pull => Arc::new(PullRuntime::new(
                name.clone(),
                Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
            )),
        };
        adapters.push(adapter);
    }

    if adapters.is_empty() {
        bail!("no runtimes loaded");
    }
    tracing::info!(count = adapters.len(), "runtimes loaded");

    let scheduler = SchedulerService::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.store) as Arc<dyn NodeStore>,
        Arc::clone(&ctx.store) as Arc<dyn EventBus>,
        Arc::new(ParamRenderer),
        adapters,
    )?;

    match cli.command {
        Command::Run | Command::Loop => {
            let shutdown = shutdown_on_signals();
            scheduler.run(shutdown).await?;
        }
    }
    Ok(())
}
