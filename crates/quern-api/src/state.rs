//! Shared state for route handlers.

use std::sync::Arc;

use chrono::Duration;

use quern_core::config::{PipelineConfig, SecretsConfig};
use quern_pipeline::store::NodeStore;

use crate::auth::UserTokenVerifier;

/// State shared by every route handler.
#[derive(Clone)]
pub struct AppState {
    /// State store client.
    pub store: Arc<dyn NodeStore>,
    /// Static catalog.
    pub config: Arc<PipelineConfig>,
    /// Per-runtime callback secrets and signing keys.
    pub secrets: Arc<SecretsConfig>,
    /// User bearer token verifier.
    pub verifier: Arc<UserTokenVerifier>,
}

impl AppState {
    /// Builds the state from loaded configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn NodeStore>,
        config: Arc<PipelineConfig>,
        secrets: SecretsConfig,
    ) -> Self {
        let verifier = Arc::new(UserTokenVerifier::new(&secrets.jwt));
        Self {
            store,
            config,
            secrets: Arc::new(secrets),
            verifier,
        }
    }

    /// Holdoff granted to nodes that become `available` through the
    /// callback endpoint.
    #[must_use]
    pub fn holdoff(&self) -> Duration {
        Duration::minutes(self.config.tarball.holdoff_minutes)
    }
}
