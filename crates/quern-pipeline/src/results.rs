//! Structured result ingestion.
//!
//! Runtime adapters and the lab callback endpoint both funnel external
//! job outcomes through this module: a backend-specific payload is
//! translated into a [`ResultsPayload`], then applied to the node tree in
//! the state store. Application is idempotent so that re-delivered
//! callbacks never duplicate children.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use quern_core::config::RuntimeKind;
use quern_core::{Node, NodeKind, NodeResult, NodeState};

use crate::error::{Error, Result};
use crate::store::{CasOutcome, NodeFilter, NodeStore};

/// One reported test case or suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Test or suite name.
    pub name: String,
    /// Reported outcome.
    pub result: NodeResult,
    /// Log and data artifacts attached to this entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    /// Nested results; non-empty marks this entry as a suite.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TestResult>,
}

/// The common shape every backend's completion payload reduces to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsPayload {
    /// External job id, used to locate the node when the caller has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Overall job outcome.
    pub result: NodeResult,
    /// Job-level artifacts (full logs, result files).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    /// Per-test results, preserving suite hierarchy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestResult>,
    /// Infrastructure error class, when the runtime itself broke.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Infrastructure error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Translates a raw payload for the given runtime kind.
///
/// LAVA labs post their own callback format; every other backend posts
/// the common shape directly.
///
/// # Errors
///
/// Returns a payload rejection when the document does not parse; the
/// caller maps this to a 4xx with no node side effects.
pub fn parse_runtime_payload(kind: RuntimeKind, payload: &serde_json::Value) -> Result<ResultsPayload> {
    match kind {
        RuntimeKind::Lava => crate::runtime::lava::parse_callback(payload),
        _ => serde_json::from_value(payload.clone())
            .map_err(|e| Error::rejected(format!("invalid results payload: {e}"))),
    }
}

/// Locates the node a payload belongs to via its external job id.
///
/// # Errors
///
/// Returns a payload rejection when no node carries the job id.
pub async fn locate_node<S: NodeStore + ?Sized>(
    store: &S,
    payload: &ResultsPayload,
) -> Result<Node> {
    let job_id = payload
        .job_id
        .as_deref()
        .ok_or_else(|| Error::rejected("payload carries no job id"))?;
    let mut nodes = store
        .find(&NodeFilter::new().job_id(job_id))
        .await?;
    nodes
        .pop()
        .ok_or_else(|| Error::rejected(format!("no node for job id {job_id}")))
}

/// Applies a results payload to `node` and its subtree.
///
/// Build and suite nodes transition to `available` (they may still grow
/// children) with a fresh holdoff; leaf test nodes go straight to
/// `done`. Re-delivery for a node that is already terminal only merges
/// artifacts, making duplicate callbacks safe.
///
/// # Errors
///
/// Propagates store failures.
pub async fn apply_results<S: NodeStore + ?Sized>(
    store: &S,
    node: &Node,
    payload: &ResultsPayload,
    holdoff: Duration,
) -> Result<Node> {
    let mut current = store
        .get(&node.id)
        .await?
        .ok_or_else(|| Error::NodeNotFound {
            id: node.id.clone(),
        })?;

    if current.is_terminal() {
        tracing::debug!(node = %current.id, "results re-delivered for terminal node");
        if !payload.artifacts.is_empty() {
            current.artifacts.extend(payload.artifacts.clone());
            if let CasOutcome::Updated(updated) = store.update(&current, None).await? {
                current = updated;
            }
        }
        return Ok(current);
    }

    create_children(store, &current, &payload.tests).await?;

    current.artifacts.extend(payload.artifacts.clone());
    current.data.error_code = payload.error_code.clone();
    current.data.error_msg = payload.error_msg.clone();
    current.set_result(payload.result)?;

    if current.state != NodeState::Running {
        // A duplicate delivery raced an earlier one past the transition;
        // keep the state and refresh the payload-derived fields.
        store.update(&current, None).await?;
        return store
            .get(&current.id)
            .await?
            .ok_or_else(|| Error::NodeNotFound {
                id: current.id.clone(),
            });
    }

    let goes_available = matches!(current.kind, NodeKind::Kbuild | NodeKind::Job);
    if goes_available {
        current.transition(NodeState::Available)?;
        current.holdoff = Some(Utc::now() + holdoff);
    } else {
        current.transition(NodeState::Done)?;
    }

    match store.update(&current, Some(NodeState::Running)).await? {
        CasOutcome::Updated(updated) => Ok(updated),
        CasOutcome::StateMismatch { actual } => {
            // Lost to a concurrent transition (most likely the timeout
            // sweep); re-read so the caller observes the winner.
            tracing::warn!(node = %current.id, %actual, "results application lost state race");
            store
                .get(&current.id)
                .await?
                .ok_or_else(|| Error::NodeNotFound {
                    id: current.id.clone(),
                })
        }
    }
}

/// Creates child nodes for reported tests, skipping any that already
/// exist under the same parent (idempotent re-application).
async fn create_children<S: NodeStore + ?Sized>(
    store: &S,
    parent: &Node,
    tests: &[TestResult],
) -> Result<()> {
    for test in tests {
        let existing = store
            .find(
                &NodeFilter::new()
                    .parent(parent.id.clone())
                    .name(test.name.clone()),
            )
            .await?;
        if !existing.is_empty() {
            continue;
        }

        let kind = if test.children.is_empty() {
            NodeKind::Test
        } else {
            NodeKind::Job
        };
        let mut child = Node::child_of(parent, kind, test.name.clone());
        child.group = Some(parent.name.clone());
        child.artifacts = test.artifacts.clone();
        let created = store.create(child).await?;

        if test.children.is_empty() {
            let mut done = created;
            done.set_result(test.result)?;
            done.transition(NodeState::Done)?;
            store.update(&done, Some(NodeState::Running)).await?;
        } else {
            Box::pin(create_children(store, &created, &test.children)).await?;
            let mut done = created;
            done.set_result(test.result)?;
            done.transition(NodeState::Done)?;
            store.update(&done, Some(NodeState::Running)).await?;
        }
    }
    Ok(())
}
