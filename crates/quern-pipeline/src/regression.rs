//! Regression detection.
//!
//! Watches for nodes finishing with `fail` and compares them against the
//! most recent sibling run with the same fingerprint (tree, branch,
//! name, arch, config_full, compiler, platform). A pass→fail transition
//! emits a `regression` node attached to the failing node and
//! cross-linking both runs.
//!
//! Infrastructure failures (`data.error_code` set) are not code
//! regressions and are skipped.

use std::sync::Arc;

use quern_core::{Node, NodeKind, NodeResult, NodeState};

use crate::bus::{EventBus, NodeEvent, NODE_CHANNEL};
use crate::error::Result;
use crate::service::ShutdownSignal;
use crate::store::{NodeFilter, NodeStore};

/// The regression tracker service.
pub struct RegressionService {
    store: Arc<dyn NodeStore>,
    bus: Arc<dyn EventBus>,
}

impl RegressionService {
    /// Builds the tracker.
    #[must_use]
    pub fn new(store: Arc<dyn NodeStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Runs the event loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns bus errors that persist after the subscription is lost.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut subscription = self.bus.subscribe(NODE_CHANNEL).await?;
        tracing::info!("tracking regressions");

        loop {
            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("regression tracker shutting down");
                    return Ok(());
                }
                event = subscription.next() => {
                    match event? {
                        Some(event) => {
                            if Self::is_candidate(&event) {
                                if let Err(err) = self.check_event(&event).await {
                                    tracing::error!(node = %event.id, error = %err, "regression check failed");
                                }
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn is_candidate(event: &NodeEvent) -> bool {
        event.state == NodeState::Done
            && event.result == Some(NodeResult::Fail)
            && matches!(event.kind, NodeKind::Kbuild | NodeKind::Job | NodeKind::Test)
    }

    /// Checks one terminal failure for a pass→fail transition.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn check_event(&self, event: &NodeEvent) -> Result<Option<Node>> {
        let Some(failed) = self.store.get(&event.id).await? else {
            return Ok(None);
        };
        if failed.data.error_code.is_some() {
            // Tool failure, not a kernel regression.
            return Ok(None);
        }
        if failed.group.is_none() {
            return Ok(None);
        }

        let Some(previous) = self.last_matching_run(&failed).await? else {
            return Ok(None);
        };
        if previous.result != Some(NodeResult::Pass) {
            return Ok(None);
        }

        let regression = self.create_regression(&failed, &previous).await?;
        tracing::info!(
            node = %failed.id,
            previous = %previous.id,
            regression = %regression.id,
            name = %failed.name,
            "regression detected"
        );
        Ok(Some(regression))
    }

    /// Finds the most recent earlier run with the same fingerprint.
    async fn last_matching_run(&self, failed: &Node) -> Result<Option<Node>> {
        let mut filter = NodeFilter::new()
            .name(failed.name.clone())
            .kind(failed.kind)
            .state(NodeState::Done)
            .created_before(failed.created);
        if let Some((tree, branch)) = failed.tree_branch() {
            filter = filter.tree(tree).branch(branch);
        }
        filter.arch.clone_from(&failed.data.arch);
        filter.compiler.clone_from(&failed.data.compiler);
        filter.config_full.clone_from(&failed.data.config_full);
        filter.platform.clone_from(&failed.data.platform);

        let mut runs = self.store.find(&filter).await?;
        runs.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(runs.into_iter().next())
    }

    /// Creates the regression record and cross-links the failing node.
    async fn create_regression(&self, failed: &Node, previous: &Node) -> Result<Node> {
        let mut record = Node::child_of(failed, NodeKind::Regression, failed.name.clone());
        record.group = failed.group.clone();
        record.artifacts = failed.artifacts.clone();
        record.data = failed.data.clone();
        record.data.extra.insert(
            "pass_node".to_string(),
            serde_json::Value::String(previous.id.to_string()),
        );
        record.data.extra.insert(
            "fail_node".to_string(),
            serde_json::Value::String(failed.id.to_string()),
        );
        record.state = NodeState::Done;
        record.result = Some(NodeResult::Fail);
        let record = self.store.create(record).await?;

        let mut update = failed.clone();
        update.data.regression = Some(record.id.clone());
        self.store.update(&update, None).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventOp;
    use crate::store::memory::MemoryStore;

    async fn finished_run(
        store: &MemoryStore,
        name: &str,
        result: NodeResult,
        commit: &str,
    ) -> Node {
        let checkout = store
            .create(Node::checkout("mainline", "master", commit, "url"))
            .await
            .unwrap();
        let mut job = Node::child_of(&checkout, NodeKind::Job, name);
        job.group = Some(name.to_string());
        job.data.arch = Some("arm64".to_string());
        job.data.compiler = Some("gcc-12".to_string());
        job.data.config_full = Some("defconfig".to_string());
        job.data.platform = Some("bcm2711-rpi-4-b".to_string());
        let job = store.create(job).await.unwrap();

        let mut done = store.get(&job.id).await.unwrap().unwrap();
        done.set_result(result).unwrap();
        done.transition(NodeState::Done).unwrap();
        store.update(&done, None).await.unwrap().into_node().unwrap()
    }

    fn service(store: &Arc<MemoryStore>) -> RegressionService {
        RegressionService::new(
            Arc::clone(store) as Arc<dyn NodeStore>,
            Arc::clone(store) as Arc<dyn EventBus>,
        )
    }

    #[tokio::test]
    async fn pass_to_fail_creates_regression() {
        let store = Arc::new(MemoryStore::new());
        finished_run(&store, "baseline-arm64", NodeResult::Pass, "commit-a").await;
        let failed = finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-b").await;

        let event = NodeEvent::for_node(EventOp::Updated, &failed);
        let regression = service(&store).check_event(&event).await.unwrap().unwrap();

        assert_eq!(regression.kind, NodeKind::Regression);
        assert_eq!(regression.parent.as_ref(), Some(&failed.id));
        assert_eq!(
            regression.data.extra["fail_node"],
            serde_json::Value::String(failed.id.to_string())
        );

        let updated = store.get(&failed.id).await.unwrap().unwrap();
        assert_eq!(updated.data.regression.as_ref(), Some(&regression.id));
    }

    #[tokio::test]
    async fn first_failure_without_prior_pass_is_not_a_regression() {
        let store = Arc::new(MemoryStore::new());
        let failed = finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-a").await;

        let event = NodeEvent::for_node(EventOp::Updated, &failed);
        assert!(service(&store).check_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_after_fail_is_not_a_regression() {
        let store = Arc::new(MemoryStore::new());
        finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-a").await;
        let failed = finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-b").await;

        let event = NodeEvent::for_node(EventOp::Updated, &failed);
        assert!(service(&store).check_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn infrastructure_errors_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        finished_run(&store, "baseline-arm64", NodeResult::Pass, "commit-a").await;
        let failed = finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-b").await;

        let mut update = store.get(&failed.id).await.unwrap().unwrap();
        update.data.error_code = Some("runtime_error".to_string());
        let failed = store.update(&update, None).await.unwrap().into_node().unwrap();

        let event = NodeEvent::for_node(EventOp::Updated, &failed);
        assert!(service(&store).check_event(&event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn different_fingerprint_does_not_match() {
        let store = Arc::new(MemoryStore::new());
        let passed = finished_run(&store, "baseline-arm64", NodeResult::Pass, "commit-a").await;
        let mut other_arch = store.get(&passed.id).await.unwrap().unwrap();
        other_arch.data.arch = Some("x86_64".to_string());
        store.update(&other_arch, None).await.unwrap();

        let failed = finished_run(&store, "baseline-arm64", NodeResult::Fail, "commit-b").await;
        let event = NodeEvent::for_node(EventOp::Updated, &failed);
        assert!(service(&store).check_event(&event).await.unwrap().is_none());
    }
}
