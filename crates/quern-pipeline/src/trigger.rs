//! The trigger.
//!
//! Watches the configured (tree, branch) pairs and creates a root
//! `checkout` node whenever the remote tip commit is one the pipeline
//! has not tested recently. The state store is the authority on
//! duplicates: a checkout is only created when no prior node carries the
//! same tree fingerprint within the frequency window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use quern_core::config::{BuildConfig, PipelineConfig};
use quern_core::node::tree_fingerprint;
use quern_core::{Node, NodeKind};

use crate::error::{Error, Result};
use crate::rules::parse_frequency;
use crate::service::ShutdownSignal;
use crate::store::{NodeFilter, NodeStore};

/// Resolves the tip commit of a remote branch.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Returns the commit hash at the tip of `branch` on `url`.
    async fn head_commit(&self, url: &str, branch: &str) -> Result<String>;
}

/// Revision source shelling out to `git ls-remote`.
#[derive(Debug, Clone, Default)]
pub struct GitRemote;

#[async_trait]
impl RevisionSource for GitRemote {
    async fn head_commit(&self, url: &str, branch: &str) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .arg("ls-remote")
            .arg(url)
            .arg(format!("refs/heads/{branch}"))
            .output()
            .await
            .map_err(|e| Error::SourceTree {
                tree: url.to_string(),
                message: format!("git ls-remote failed to start: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::SourceTree {
                tree: url.to_string(),
                message: format!(
                    "git ls-remote exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(str::to_string)
            .filter(|commit| !commit.is_empty())
            .ok_or_else(|| Error::SourceTree {
                tree: url.to_string(),
                message: format!("no ref for branch {branch}"),
            })
    }
}

/// The trigger service.
pub struct TriggerService {
    config: Arc<PipelineConfig>,
    store: Arc<dyn NodeStore>,
    source: Arc<dyn RevisionSource>,
    force: bool,
}

impl TriggerService {
    /// Builds the trigger.
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn NodeStore>,
        source: Arc<dyn RevisionSource>,
        force: bool,
    ) -> Self {
        Self {
            config,
            store,
            source,
            force,
        }
    }

    /// Walks every build config once.
    ///
    /// Remote failures are logged and skipped so one broken tree never
    /// starves the others; store failures abandon the tick.
    ///
    /// # Errors
    ///
    /// Returns store errors. Remote failures never propagate.
    pub async fn poll(&self) -> Result<()> {
        for (name, build) in &self.config.build_configs {
            let Some(tree) = self.config.trees.get(&build.tree) else {
                continue;
            };
            let commit = match self.source.head_commit(&tree.url, &build.branch).await {
                Ok(commit) => commit,
                Err(err) => {
                    tracing::warn!(build = %name, error = %err, "tip resolution failed");
                    continue;
                }
            };
            self.create_checkout(build, &tree.url, &commit).await?;
        }
        Ok(())
    }

    /// Creates the checkout for a resolved tip unless one already exists
    /// within the frequency window.
    ///
    /// # Errors
    ///
    /// Returns store errors; frequency grammar errors are configuration
    /// mistakes and also propagate.
    pub async fn create_checkout(
        &self,
        build: &BuildConfig,
        url: &str,
        commit: &str,
    ) -> Result<Option<Node>> {
        let treeid = tree_fingerprint(&build.tree, &build.branch, commit, &[]);

        if !self.force {
            let frequency = build
                .frequency
                .as_deref()
                .unwrap_or(&self.config.trigger.default_frequency);
            let window = parse_frequency(frequency)?;
            let existing = self
                .store
                .find(
                    &NodeFilter::new()
                        .kind(NodeKind::Checkout)
                        .treeid(&*treeid)
                        .created_after(Utc::now() - window),
                )
                .await?;
            if !existing.is_empty() {
                tracing::debug!(
                    tree = %build.tree,
                    branch = %build.branch,
                    commit,
                    "checkout exists within frequency window"
                );
                return Ok(None);
            }
        }

        let mut checkout = Node::checkout(&build.tree, &build.branch, commit, url);
        checkout.treeid = Some(treeid);
        let created = self.store.create(checkout).await?;
        tracing::info!(
            node = %created.id,
            tree = %build.tree,
            branch = %build.branch,
            commit,
            "created checkout"
        );
        Ok(Some(created))
    }

    /// Runs the polling loop until shutdown. A zero poll period performs
    /// a single pass.
    ///
    /// # Errors
    ///
    /// Returns store errors from the first tick in single-pass mode;
    /// looping mode logs and continues.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let period = self.config.trigger.poll_period_secs;
        if period == 0 {
            return self.poll().await;
        }

        loop {
            if let Err(err) = self.poll().await {
                tracing::error!(error = %err, "trigger tick abandoned");
            }
            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("trigger shutting down");
                    return Ok(());
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(period)) => {}
            }
        }
    }
}
