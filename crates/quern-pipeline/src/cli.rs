//! Shared command-line plumbing for the service binaries.
//!
//! Every service takes `--settings` (the static catalog) and
//! `--secrets`, initializes logging, builds the HTTP state store client,
//! and runs until SIGINT/SIGTERM. A configuration error aborts startup
//! with a non-zero exit; running services never exit on transient
//! errors.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use quern_core::config::{PipelineConfig, SecretsConfig};
use quern_core::{init_logging, LogFormat};

use crate::error::Result;
use crate::service::{shutdown_pair, watch_signals, ShutdownSignal};
use crate::store::http::HttpStore;

/// Arguments shared by every service binary.
#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Path to the pipeline settings file.
    #[arg(long, default_value = "config/quern.toml")]
    pub settings: PathBuf,

    /// Path to the secrets file.
    #[arg(long, default_value = "config/secrets.toml")]
    pub secrets: PathBuf,

    /// Emit JSON logs instead of pretty ones.
    #[arg(long)]
    pub json_logs: bool,

    /// Serve a liveness endpoint on this port. Disabled when absent.
    #[arg(long)]
    pub health_port: Option<u16>,
}

/// Shared collaborators every service starts from.
pub struct ServiceContext {
    /// The static catalog.
    pub config: Arc<PipelineConfig>,
    /// Loaded secrets.
    pub secrets: SecretsConfig,
    /// State store / event bus client.
    pub store: Arc<HttpStore>,
}

impl ServiceArgs {
    /// Initializes logging and loads configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, which abort startup.
    pub fn init(&self) -> Result<ServiceContext> {
        init_logging(if self.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        });

        let config = Arc::new(PipelineConfig::load(&self.settings)?);
        let secrets = SecretsConfig::load(&self.secrets)?;
        let store = Arc::new(HttpStore::new(&config.api, api_token())?);

        if let Some(port) = self.health_port {
            tokio::spawn(serve_health(port));
        }

        Ok(ServiceContext {
            config,
            secrets,
            store,
        })
    }
}

async fn serve_health(port: u16) {
    use axum::http::StatusCode;
    use axum::routing::get;

    let app = axum::Router::new().route("/health", get(|| async { StatusCode::OK }));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "health endpoint failed");
            }
        }
        Err(err) => tracing::error!(error = %err, port, "health endpoint could not bind"),
    }
}

fn api_token() -> Option<String> {
    std::env::var("QUERN_API_TOKEN").ok()
}

/// Installs signal handlers and returns the service's shutdown signal.
#[must_use]
pub fn shutdown_on_signals() -> ShutdownSignal {
    let (controller, signal) = shutdown_pair();
    tokio::spawn(async move {
        if let Err(err) = watch_signals(controller).await {
            tracing::error!(error = %err, "signal handler failed");
        }
    });
    signal
}
