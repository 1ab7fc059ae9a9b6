//! Retry siblings.
//!
//! A failed or incomplete job is never mutated back to life. Instead a
//! fresh sibling node is created with the same name and parameters and an
//! incremented `retry_counter`, so every attempt stays visible in the
//! tree and the counter chain is strictly increasing.

use quern_core::{Node, NodeKind, NodeResult};

use crate::error::{Error, Result};
use crate::store::NodeStore;

/// Maximum retry counter; the attempt carrying this value is final.
pub const MAX_RETRY_COUNTER: u32 = 3;

/// Job names eligible for fail-retry (boot smoke tests).
const BASELINE_PREFIX: &str = "baseline";

/// Returns true if a terminal node should get a retry sibling.
///
/// Kernel builds retry on `fail` and `incomplete` (build infrastructure
/// flakiness dominates genuine breakage on the first attempt); test
/// suites retry on `incomplete`, and baseline boot jobs additionally on
/// `fail` since board flakiness dominates there.
#[must_use]
pub fn wants_retry(node: &Node) -> bool {
    if node.data.retry_counter >= MAX_RETRY_COUNTER {
        return false;
    }
    match node.result {
        Some(NodeResult::Incomplete) => {
            matches!(node.kind, NodeKind::Kbuild | NodeKind::Job)
        }
        Some(NodeResult::Fail) => {
            node.kind == NodeKind::Kbuild || node.name.starts_with(BASELINE_PREFIX)
        }
        _ => false,
    }
}

/// Returns true if the forwarder should suppress this node in favour of
/// a later attempt.
///
/// Filtered nodes are still marked `processed_by_reporting` so they are
/// never revisited; only the final attempt reaches the reporting sink.
#[must_use]
pub fn suppressed_from_reporting(node: &Node) -> bool {
    wants_retry(node)
}

/// Ensures the retry sibling for a terminal node exists, creating it if
/// no later attempt is present yet.
///
/// Both the scheduler (on submission failure) and the forwarder (when
/// filtering a non-final attempt) call this; querying for an existing
/// later attempt first keeps the chain single-writer.
///
/// # Errors
///
/// Propagates store failures.
pub async fn ensure_retry_sibling<S: NodeStore + ?Sized>(
    store: &S,
    failed: &Node,
) -> Result<Option<Node>> {
    let Some(parent_id) = failed.parent.clone() else {
        return Ok(None);
    };
    let siblings = store
        .find(
            &crate::store::NodeFilter::new()
                .parent(parent_id)
                .name(failed.name.clone()),
        )
        .await?;
    if let Some(existing) = siblings
        .into_iter()
        .find(|s| s.data.retry_counter > failed.data.retry_counter)
    {
        return Ok(Some(existing));
    }
    spawn_retry_sibling(store, failed).await
}

/// Creates the retry sibling for a terminal node.
///
/// Returns `None` when the parent has stopped accepting children, which
/// ends the retry chain early.
///
/// # Errors
///
/// Propagates store failures other than the closed-parent rejection.
pub async fn spawn_retry_sibling<S: NodeStore + ?Sized>(
    store: &S,
    failed: &Node,
) -> Result<Option<Node>> {
    let Some(parent_id) = failed.parent.clone() else {
        return Ok(None);
    };
    let Some(parent) = store.get(&parent_id).await? else {
        return Ok(None);
    };

    let mut sibling = Node::child_of(&parent, failed.kind, failed.name.clone());
    sibling.data = failed.data.clone();
    sibling.data.retry_counter = failed.data.retry_counter + 1;
    sibling.data.job_id = None;
    sibling.data.error_code = None;
    sibling.data.error_msg = None;
    sibling.data.processed_by_reporting = false;

    match store.create(sibling).await {
        Ok(created) => {
            tracing::info!(
                node = %created.id,
                name = %created.name,
                retry_counter = created.data.retry_counter,
                "spawned retry sibling"
            );
            Ok(Some(created))
        }
        Err(Error::ParentClosed { parent, state }) => {
            tracing::info!(%parent, %state, "parent closed, ending retry chain");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use quern_core::NodeState;

    fn terminal(kind: NodeKind, name: &str, result: NodeResult, counter: u32) -> Node {
        let parent = Node::checkout("mainline", "master", "abc", "url");
        let mut node = Node::child_of(&parent, kind, name);
        node.result = Some(result);
        node.state = NodeState::Done;
        node.data.retry_counter = counter;
        node
    }

    #[test]
    fn incomplete_kbuild_wants_retry() {
        let node = terminal(NodeKind::Kbuild, "kbuild-gcc-12-x86", NodeResult::Incomplete, 0);
        assert!(wants_retry(&node));
    }

    #[test]
    fn failed_kbuild_wants_retry() {
        let node = terminal(NodeKind::Kbuild, "kbuild-gcc-12-x86", NodeResult::Fail, 0);
        assert!(wants_retry(&node));
    }

    #[test]
    fn failed_suite_does_not_retry() {
        let node = terminal(NodeKind::Job, "kselftest-net", NodeResult::Fail, 0);
        assert!(!wants_retry(&node));
    }

    #[test]
    fn failed_baseline_wants_retry() {
        let node = terminal(NodeKind::Job, "baseline-arm64", NodeResult::Fail, 2);
        assert!(wants_retry(&node));
    }

    #[test]
    fn final_attempt_does_not_retry() {
        let node = terminal(
            NodeKind::Job,
            "baseline-arm64",
            NodeResult::Fail,
            MAX_RETRY_COUNTER,
        );
        assert!(!wants_retry(&node));
        assert!(!suppressed_from_reporting(&node));
    }

    #[tokio::test]
    async fn sibling_increments_counter() {
        let store = MemoryStore::new();
        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        let mut failed = Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-x86");
        failed.data.retry_counter = 1;
        failed.data.job_id = Some("lava-4242".to_string());
        let failed = store.create(failed).await.unwrap();

        let sibling = spawn_retry_sibling(&store, &failed).await.unwrap().unwrap();
        assert_eq!(sibling.data.retry_counter, 2);
        assert_eq!(sibling.name, failed.name);
        assert_eq!(sibling.parent, failed.parent);
        assert_eq!(sibling.data.job_id, None);
        assert_ne!(sibling.id, failed.id);
    }

    #[tokio::test]
    async fn ensure_does_not_duplicate_existing_sibling() {
        let store = MemoryStore::new();
        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        let failed = store
            .create(Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-x86"))
            .await
            .unwrap();

        let first = ensure_retry_sibling(&store, &failed).await.unwrap().unwrap();
        let second = ensure_retry_sibling(&store, &failed).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);

        let siblings = store
            .find(
                &crate::store::NodeFilter::new()
                    .parent(checkout.id.clone())
                    .name("kbuild-gcc-12-x86"),
            )
            .await
            .unwrap();
        assert_eq!(siblings.len(), 2);
    }

    #[tokio::test]
    async fn closed_parent_ends_chain() {
        let store = MemoryStore::new();
        let mut checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        let failed = store
            .create(Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-x86"))
            .await
            .unwrap();

        checkout.transition(NodeState::Available).unwrap();
        store.update(&checkout, None).await.unwrap();
        checkout.transition(NodeState::Closing).unwrap();
        store.update(&checkout, None).await.unwrap();

        let sibling = spawn_retry_sibling(&store, &failed).await.unwrap();
        assert!(sibling.is_none());
    }
}
