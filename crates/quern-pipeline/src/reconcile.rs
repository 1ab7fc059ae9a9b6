//! The timeout/holdoff reconciler.
//!
//! Periodically sweeps every non-terminal node and drives the lifecycle
//! forward:
//!
//! - past its `timeout`, a node and all its unfinished descendants are
//!   expired (`incomplete` if still `running`, otherwise the holdoff
//!   completion convention applies and the existing or `pass` result
//!   stands);
//! - past its `holdoff`, an `available` node either completes (all
//!   children `done`) or moves to `closing`, which bars new children;
//! - a `closing` node completes once its last child finishes.
//!
//! Nodes are processed child-before-parent within one sweep so parent
//! aggregation always observes final children. Every transition is a
//! CAS write; losing a race just means another service got there first.

use std::sync::Arc;

use chrono::Utc;

use quern_core::{Node, NodeResult, NodeState};

use crate::aggregate::aggregate;
use crate::error::Result;
use crate::service::ShutdownSignal;
use crate::store::{NodeFilter, NodeStore};

/// Counters for one reconciler sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Nodes expired past their timeout (including descendants).
    pub expired: usize,
    /// Nodes completed with an aggregated result.
    pub completed: usize,
    /// Nodes moved to `closing`.
    pub closing: usize,
}

/// The reconciler service.
pub struct ReconcilerService {
    store: Arc<dyn NodeStore>,
    poll_period: std::time::Duration,
}

impl ReconcilerService {
    /// Builds the reconciler.
    #[must_use]
    pub fn new(store: Arc<dyn NodeStore>, poll_period: std::time::Duration) -> Self {
        Self { store, poll_period }
    }

    /// Runs the sweep loop until shutdown.
    ///
    /// # Errors
    ///
    /// Never returns an error from sweeps; store failures are logged and
    /// the next tick retries.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        tracing::info!("reconciler sweeping for stale nodes");
        loop {
            match self.sweep().await {
                Ok(summary) => {
                    if summary != SweepSummary::default() {
                        tracing::info!(
                            expired = summary.expired,
                            completed = summary.completed,
                            closing = summary.closing,
                            "sweep applied transitions"
                        );
                    }
                }
                Err(err) => tracing::error!(error = %err, "sweep failed"),
            }

            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("reconciler shutting down");
                    return Ok(());
                }
                () = tokio::time::sleep(self.poll_period) => {}
            }
        }
    }

    /// Performs one sweep over all pending nodes.
    ///
    /// # Errors
    ///
    /// Returns store failures; the sweep is abandoned and retried next
    /// tick.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let mut pending = self
            .store
            .find(
                &NodeFilter::new()
                    .state(NodeState::Running)
                    .state(NodeState::Available)
                    .state(NodeState::Closing),
            )
            .await?;

        // Child-before-parent: deeper paths first.
        pending.sort_by_key(|node| std::cmp::Reverse(node.path.len()));

        let now = Utc::now();
        let mut summary = SweepSummary::default();

        for node in pending {
            // Re-read: an earlier iteration may have expired this node
            // as a descendant.
            let Some(node) = self.store.get(&node.id).await? else {
                continue;
            };
            if node.is_terminal() {
                continue;
            }

            if now >= node.timeout {
                summary.expired += self.expire_subtree(node).await?;
                continue;
            }

            match node.state {
                NodeState::Available => {
                    let holdoff_elapsed = node.holdoff.is_none_or(|h| now >= h);
                    if !holdoff_elapsed {
                        continue;
                    }
                    if self.children_all_done(&node).await? {
                        self.complete(node).await?;
                        summary.completed += 1;
                    } else {
                        self.close(node).await?;
                        summary.closing += 1;
                    }
                }
                NodeState::Closing => {
                    if self.children_all_done(&node).await? {
                        self.complete(node).await?;
                        summary.completed += 1;
                    }
                }
                NodeState::Running | NodeState::Done => {}
            }
        }

        Ok(summary)
    }

    async fn children_all_done(&self, node: &Node) -> Result<bool> {
        let children = self
            .store
            .find(&NodeFilter::new().parent(node.id.clone()))
            .await?;
        Ok(children.iter().all(Node::is_terminal))
    }

    /// Expires a node and every unfinished descendant, leaves first.
    async fn expire_subtree(&self, node: Node) -> Result<usize> {
        let mut expired = 0;
        let children = self
            .store
            .find(&NodeFilter::new().parent(node.id.clone()))
            .await?;
        for child in children {
            if !child.is_terminal() {
                expired += Box::pin(self.expire_subtree(child)).await?;
            }
        }

        let expected = node.state;
        let mut update = node;
        if update.result.is_none() {
            let result = if update.state == NodeState::Running {
                NodeResult::Incomplete
            } else {
                // Holdoff completion convention: surviving this far
                // without a verdict counts as pass.
                NodeResult::Pass
            };
            update.set_result(result)?;
        }
        update.transition(NodeState::Done)?;

        if self
            .store
            .update(&update, Some(expected))
            .await?
            .is_updated()
        {
            tracing::debug!(node = %update.id, "expired");
            expired += 1;
        }
        Ok(expired)
    }

    /// Completes a node whose children are all terminal.
    async fn complete(&self, node: Node) -> Result<()> {
        let children = self
            .store
            .find(&NodeFilter::new().parent(node.id.clone()))
            .await?;

        let expected = node.state;
        let mut update = node;
        if update.result.is_none() {
            update.set_result(aggregate(&children))?;
        }
        update.transition(NodeState::Done)?;

        if !self
            .store
            .update(&update, Some(expected))
            .await?
            .is_updated()
        {
            tracing::debug!(node = %update.id, "lost completion race");
        }
        Ok(())
    }

    /// Moves an `available` node past holdoff to `closing`.
    async fn close(&self, node: Node) -> Result<()> {
        let mut update = node;
        update.transition(NodeState::Closing)?;
        if !self
            .store
            .update(&update, Some(NodeState::Available))
            .await?
            .is_updated()
        {
            tracing::debug!(node = %update.id, "lost closing race");
        }
        Ok(())
    }
}
