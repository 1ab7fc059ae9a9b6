//! The tarball service.
//!
//! Subscribes to checkout creations, brings a local mirror of the source
//! tree to the target commit, archives the working tree, uploads the
//! tarball and advances the checkout to `available` with a holdoff.
//!
//! The mirror is a serialized local resource: one job at a time per
//! tree. A git failure is the sole way a checkout ever becomes
//! `done/fail`; an upload failure leaves the node `running` so the
//! operation can be retried.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use quern_core::config::PipelineConfig;
use quern_core::{Node, NodeKind, NodeResult, NodeState};

use crate::blob::BlobStore;
use crate::bus::{EventBus, EventOp, NodeEvent, NODE_CHANNEL};
use crate::error::{Error, Result};
use crate::service::{Backoff, ShutdownSignal};
use crate::store::{CasOutcome, NodeStore};

const UPLOAD_ATTEMPTS: usize = 5;

/// Local mirror of kernel source trees.
#[async_trait]
pub trait SourceMirror: Send + Sync {
    /// Brings the mirror of `tree` to `commit`, fetching from `url`.
    async fn update(&self, tree: &str, url: &str, commit: &str) -> Result<()>;

    /// Applies a series of patches on top of the current head.
    async fn apply_patches(&self, tree: &str, patch_urls: &[String]) -> Result<()>;

    /// Returns the `git describe` string for the current head.
    async fn describe(&self, tree: &str) -> Result<String>;

    /// Archives the working tree into a gzipped tarball and returns its
    /// local path.
    async fn archive(&self, tree: &str, name: &str) -> Result<PathBuf>;
}

/// Mirror implementation shelling out to git.
#[derive(Debug, Clone)]
pub struct GitMirror {
    kdir: PathBuf,
    output: PathBuf,
}

impl GitMirror {
    /// Creates a mirror rooted at `kdir`, writing tarballs under
    /// `output`.
    #[must_use]
    pub fn new(kdir: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            kdir: kdir.into(),
            output: output.into(),
        }
    }

    fn tree_dir(&self, tree: &str) -> PathBuf {
        self.kdir.join(tree)
    }

    async fn git(&self, tree: &str, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .current_dir(self.tree_dir(tree))
            .args(args)
            .output()
            .await
            .map_err(|e| Error::SourceTree {
                tree: tree.to_string(),
                message: format!("git failed to start: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::SourceTree {
                tree: tree.to_string(),
                message: format!(
                    "git {} exited with {}: {}",
                    args.first().unwrap_or(&""),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceMirror for GitMirror {
    async fn update(&self, tree: &str, url: &str, commit: &str) -> Result<()> {
        let dir = self.tree_dir(tree);
        if !dir.join(".git").exists() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::SourceTree {
                    tree: tree.to_string(),
                    message: format!("creating mirror dir: {e}"),
                })?;
            self.git(tree, &["init"]).await?;
        }
        self.git(tree, &["fetch", "--depth", "1", url, commit]).await?;
        self.git(tree, &["checkout", "--force", commit]).await?;
        Ok(())
    }

    async fn apply_patches(&self, tree: &str, patch_urls: &[String]) -> Result<()> {
        for url in patch_urls {
            let response = reqwest::get(url).await.map_err(|e| Error::SourceTree {
                tree: tree.to_string(),
                message: format!("fetching patch {url}: {e}"),
            })?;
            let patch = response.bytes().await.map_err(|e| Error::SourceTree {
                tree: tree.to_string(),
                message: format!("reading patch {url}: {e}"),
            })?;

            let patch_path = self.tree_dir(tree).join(".quern-patch.mbox");
            tokio::fs::write(&patch_path, &patch)
                .await
                .map_err(|e| Error::SourceTree {
                    tree: tree.to_string(),
                    message: format!("writing patch file: {e}"),
                })?;
            self.git(tree, &["am", ".quern-patch.mbox"]).await?;
        }
        Ok(())
    }

    async fn describe(&self, tree: &str) -> Result<String> {
        self.git(tree, &["describe", "--always", "--tags"]).await
    }

    async fn archive(&self, tree: &str, name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output)
            .await
            .map_err(|e| Error::SourceTree {
                tree: tree.to_string(),
                message: format!("creating output dir: {e}"),
            })?;
        let tarball = self.output.join(format!("{name}.tar.gz"));
        let archive_arg = format!(
            "--output={}",
            tarball.to_string_lossy()
        );
        self.git(
            tree,
            &[
                "archive",
                "--format=tar.gz",
                &format!("--prefix={name}/"),
                &archive_arg,
                "HEAD",
            ],
        )
        .await?;
        Ok(tarball)
    }
}

/// The tarball service.
pub struct TarballService {
    config: Arc<PipelineConfig>,
    store: Arc<dyn NodeStore>,
    bus: Arc<dyn EventBus>,
    blobs: Arc<dyn BlobStore>,
    mirror: Arc<dyn SourceMirror>,
    tree_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TarballService {
    /// Builds the tarball service.
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn NodeStore>,
        bus: Arc<dyn EventBus>,
        blobs: Arc<dyn BlobStore>,
        mirror: Arc<dyn SourceMirror>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            blobs,
            mirror,
            tree_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn tree_lock(&self, tree: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.tree_locks.lock().await;
        Arc::clone(
            locks
                .entry(tree.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Runs the event loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns bus errors that persist after the subscription is lost.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut subscription = self.bus.subscribe(NODE_CHANNEL).await?;
        tracing::info!("tarball service listening for checkout events");

        loop {
            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("tarball service shutting down");
                    return Ok(());
                }
                event = subscription.next() => {
                    match event? {
                        Some(event) => {
                            if self.is_new_checkout(&event) {
                                if let Err(err) = self.process_checkout(&event.id).await {
                                    tracing::error!(node = %event.id, error = %err, "tarball failed");
                                }
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn is_new_checkout(&self, event: &NodeEvent) -> bool {
        event.op == EventOp::Created
            && event.kind == NodeKind::Checkout
            && event.state == NodeState::Running
    }

    /// Produces and publishes the tarball for one checkout.
    ///
    /// # Errors
    ///
    /// Returns store and upload errors; git failures are terminal for the
    /// node and do not propagate.
    pub async fn process_checkout(&self, id: &quern_core::NodeId) -> Result<()> {
        let Some(node) = self.store.get(id).await? else {
            return Ok(());
        };
        if node.state != NodeState::Running {
            return Ok(());
        }
        let Some(revision) = node.data.kernel_revision.clone() else {
            return Ok(());
        };

        let lock = self.tree_lock(&revision.tree).await;
        let _guard = lock.lock().await;

        let prepared = async {
            self.mirror
                .update(&revision.tree, &revision.url, &revision.commit)
                .await?;
            let patches = patch_urls(&node);
            if !patches.is_empty() {
                self.mirror.apply_patches(&revision.tree, &patches).await?;
            }
            self.mirror.describe(&revision.tree).await
        }
        .await;

        let describe = match prepared {
            Ok(describe) => describe,
            Err(err) => {
                // Sole path by which a checkout fails.
                tracing::warn!(node = %node.id, error = %err, "git update failed");
                return self.fail_checkout(node).await;
            }
        };

        let name = format!(
            "linux-{}-{}-{describe}",
            revision.tree, revision.branch
        );
        let tarball_path = match self.mirror.archive(&revision.tree, &name).await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(node = %node.id, error = %err, "archive failed");
                return self.fail_checkout(node).await;
            }
        };

        let tarball_name = format!("{name}.tar.gz");
        let url = self.upload_with_retry(&tarball_name, &tarball_path).await?;
        let _ = tokio::fs::remove_file(&tarball_path).await;

        self.publish_checkout(node, &describe, &url).await
    }

    async fn upload_with_retry(&self, name: &str, path: &std::path::Path) -> Result<String> {
        let mut backoff = Backoff::new();
        let mut last_err = None;
        for _ in 0..UPLOAD_ATTEMPTS {
            match self.blobs.upload_file(name, path).await {
                Ok(url) => return Ok(url),
                Err(err) => {
                    tracing::warn!(name, error = %err, "tarball upload failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
        // The node stays running; a later pass or the timeout sweep
        // picks it up.
        Err(last_err.unwrap_or_else(|| Error::blob("upload failed")))
    }

    async fn fail_checkout(&self, mut node: Node) -> Result<()> {
        node.set_result(NodeResult::Fail)?;
        node.data.error_code = Some("git_checkout_failure".to_string());
        node.transition(NodeState::Done)?;
        match self.store.update(&node, Some(NodeState::Running)).await? {
            CasOutcome::Updated(_) | CasOutcome::StateMismatch { .. } => Ok(()),
        }
    }

    async fn publish_checkout(&self, mut node: Node, describe: &str, url: &str) -> Result<()> {
        if let Some(revision) = node.data.kernel_revision.as_mut() {
            revision.describe = Some(describe.to_string());
        }
        node.artifacts
            .insert("tarball".to_string(), url.to_string());
        node.transition(NodeState::Available)?;
        node.holdoff =
            Some(Utc::now() + Duration::minutes(self.config.tarball.holdoff_minutes));

        match self.store.update(&node, Some(NodeState::Running)).await? {
            CasOutcome::Updated(updated) => {
                tracing::info!(node = %updated.id, describe, "checkout available");
                Ok(())
            }
            CasOutcome::StateMismatch { actual } => {
                tracing::warn!(node = %node.id, %actual, "checkout moved before publication");
                Ok(())
            }
        }
    }
}

fn patch_urls(node: &Node) -> Vec<String> {
    node.data
        .extra
        .get("patchurl")
        .and_then(|value| value.as_array())
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
