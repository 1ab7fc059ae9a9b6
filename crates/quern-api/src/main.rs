//! API server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use quern_api::{router, AppState};
use quern_core::config::{PipelineConfig, SecretsConfig};
use quern_core::{init_logging, LogFormat};
use quern_pipeline::store::http::HttpStore;
use quern_pipeline::store::NodeStore;

#[derive(Debug, Parser)]
#[command(name = "quern-api", about = "User API and lab callback handler")]
struct Cli {
    /// Path to the pipeline settings file.
    #[arg(long, default_value = "config/quern.toml")]
    settings: std::path::PathBuf,

    /// Path to the secrets file.
    #[arg(long, default_value = "config/secrets.toml")]
    secrets: std::path::PathBuf,

    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8100")]
    listen: SocketAddr,

    /// Emit JSON logs instead of pretty ones.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let config = Arc::new(PipelineConfig::load(&cli.settings)?);
    let secrets = SecretsConfig::load(&cli.secrets)?;
    let store = Arc::new(HttpStore::new(
        &config.api,
        std::env::var("QUERN_API_TOKEN").ok(),
    )?);

    let state = AppState::new(store as Arc<dyn NodeStore>, config, secrets);
    let app = router(state);

    tracing::info!(listen = %cli.listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("API server shutting down");
        })
        .await?;
    Ok(())
}
