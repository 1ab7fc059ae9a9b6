//! The state store client.
//!
//! The state store is the single source of truth: every node transition
//! is a write here, and the store linearizes concurrent writers through
//! compare-and-swap preconditions on `state`. Services never hold
//! authoritative state locally.
//!
//! Two implementations are provided: [`http::HttpStore`] against the REST
//! store, and [`memory::MemoryStore`] for tests, which also implements
//! the event bus so that writes fan out notifications exactly like the
//! production pair does.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use quern_core::{Node, NodeId, NodeKind, NodeResult, NodeState};

use crate::error::Result;

/// Result of a compare-and-swap node write.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The write was applied; the stored node is returned.
    Updated(Node),
    /// The expected state did not match; the writer must re-read and
    /// reconcile.
    StateMismatch {
        /// The state the store actually held.
        actual: NodeState,
    },
}

impl CasOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }

    /// Unwraps the stored node, panicking on a mismatch. Test helper.
    #[must_use]
    pub fn into_node(self) -> Option<Node> {
        match self {
            Self::Updated(node) => Some(node),
            Self::StateMismatch { .. } => None,
        }
    }
}

/// A query over nodes.
///
/// Fields combine with AND. The HTTP implementation serializes these into
/// the store's field-operator query grammar (`__gt`, `__lt`, `__ne` and
/// dotted paths); the in-memory implementation evaluates [`Self::matches`]
/// directly.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Node kind.
    pub kind: Option<NodeKind>,
    /// Node name.
    pub name: Option<String>,
    /// Lifecycle state; `states` allows matching several.
    pub states: Vec<NodeState>,
    /// Terminal result.
    pub result: Option<NodeResult>,
    /// Parent node id.
    pub parent: Option<NodeId>,
    /// Group label.
    pub group: Option<String>,
    /// Tree fingerprint.
    pub treeid: Option<String>,
    /// Revision tree name (`data.kernel_revision.tree`).
    pub tree: Option<String>,
    /// Revision branch (`data.kernel_revision.branch`).
    pub branch: Option<String>,
    /// Architecture (`data.arch`).
    pub arch: Option<String>,
    /// Compiler (`data.compiler`).
    pub compiler: Option<String>,
    /// Full config identifier (`data.config_full`).
    pub config_full: Option<String>,
    /// Platform (`data.platform`).
    pub platform: Option<String>,
    /// External runtime job id (`data.job_id`).
    pub job_id: Option<String>,
    /// Reporting marker (`data.processed_by_reporting`).
    pub processed_by_reporting: Option<bool>,
    /// Only nodes created strictly after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only nodes created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Only nodes last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

impl NodeFilter {
    /// Creates an empty filter matching every node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by node kind.
    #[must_use]
    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filters by node name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filters by lifecycle state. May be called repeatedly to match any
    /// of several states.
    #[must_use]
    pub fn state(mut self, state: NodeState) -> Self {
        self.states.push(state);
        self
    }

    /// Filters by terminal result.
    #[must_use]
    pub fn result(mut self, result: NodeResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Filters by parent id.
    #[must_use]
    pub fn parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Filters by tree fingerprint.
    #[must_use]
    pub fn treeid(mut self, treeid: impl Into<String>) -> Self {
        self.treeid = Some(treeid.into());
        self
    }

    /// Filters by revision tree name.
    #[must_use]
    pub fn tree(mut self, tree: impl Into<String>) -> Self {
        self.tree = Some(tree.into());
        self
    }

    /// Filters by revision branch.
    #[must_use]
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Filters by external runtime job id.
    #[must_use]
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Filters by the reporting marker.
    #[must_use]
    pub fn processed_by_reporting(mut self, processed: bool) -> Self {
        self.processed_by_reporting = Some(processed);
        self
    }

    /// Only nodes created after `instant`.
    #[must_use]
    pub fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.created_after = Some(instant);
        self
    }

    /// Only nodes created before `instant`.
    #[must_use]
    pub fn created_before(mut self, instant: DateTime<Utc>) -> Self {
        self.created_before = Some(instant);
        self
    }

    /// Only nodes last updated before `instant`.
    #[must_use]
    pub fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    /// Evaluates the filter against a node.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(kind) = self.kind {
            if node.kind != kind {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &node.name != name {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&node.state) {
            return false;
        }
        if let Some(result) = self.result {
            if node.result != Some(result) {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if node.parent.as_ref() != Some(parent) {
                return false;
            }
        }
        if let Some(group) = &self.group {
            if node.group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(treeid) = &self.treeid {
            if node.treeid.as_deref() != Some(treeid.as_str()) {
                return false;
            }
        }
        let revision = node.data.kernel_revision.as_ref();
        if let Some(tree) = &self.tree {
            if revision.map(|r| r.tree.as_str()) != Some(tree.as_str()) {
                return false;
            }
        }
        if let Some(branch) = &self.branch {
            if revision.map(|r| r.branch.as_str()) != Some(branch.as_str()) {
                return false;
            }
        }
        if let Some(arch) = &self.arch {
            if node.data.arch.as_deref() != Some(arch.as_str()) {
                return false;
            }
        }
        if let Some(compiler) = &self.compiler {
            if node.data.compiler.as_deref() != Some(compiler.as_str()) {
                return false;
            }
        }
        if let Some(config_full) = &self.config_full {
            if node.data.config_full.as_deref() != Some(config_full.as_str()) {
                return false;
            }
        }
        if let Some(platform) = &self.platform {
            if node.data.platform.as_deref() != Some(platform.as_str()) {
                return false;
            }
        }
        if let Some(job_id) = &self.job_id {
            if node.data.job_id.as_deref() != Some(job_id.as_str()) {
                return false;
            }
        }
        if let Some(processed) = self.processed_by_reporting {
            if node.data.processed_by_reporting != processed {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if node.created <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if node.created >= before {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if node.updated >= before {
                return false;
            }
        }
        true
    }

    /// Serializes the filter into REST query pairs.
    #[must_use]
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(kind) = self.kind {
            pairs.push(("kind".to_string(), kind.to_string()));
        }
        if let Some(name) = &self.name {
            pairs.push(("name".to_string(), name.clone()));
        }
        for state in &self.states {
            pairs.push(("state".to_string(), state.to_string()));
        }
        if let Some(result) = self.result {
            pairs.push(("result".to_string(), result.to_string()));
        }
        if let Some(parent) = &self.parent {
            pairs.push(("parent".to_string(), parent.to_string()));
        }
        if let Some(group) = &self.group {
            pairs.push(("group".to_string(), group.clone()));
        }
        if let Some(treeid) = &self.treeid {
            pairs.push(("treeid".to_string(), treeid.clone()));
        }
        if let Some(tree) = &self.tree {
            pairs.push(("data.kernel_revision.tree".to_string(), tree.clone()));
        }
        if let Some(branch) = &self.branch {
            pairs.push(("data.kernel_revision.branch".to_string(), branch.clone()));
        }
        if let Some(arch) = &self.arch {
            pairs.push(("data.arch".to_string(), arch.clone()));
        }
        if let Some(compiler) = &self.compiler {
            pairs.push(("data.compiler".to_string(), compiler.clone()));
        }
        if let Some(config_full) = &self.config_full {
            pairs.push(("data.config_full".to_string(), config_full.clone()));
        }
        if let Some(platform) = &self.platform {
            pairs.push(("data.platform".to_string(), platform.clone()));
        }
        if let Some(job_id) = &self.job_id {
            pairs.push(("data.job_id".to_string(), job_id.clone()));
        }
        if let Some(processed) = self.processed_by_reporting {
            pairs.push((
                "data.processed_by_reporting".to_string(),
                processed.to_string(),
            ));
        }
        if let Some(after) = self.created_after {
            pairs.push(("created__gt".to_string(), after.to_rfc3339()));
        }
        if let Some(before) = self.created_before {
            pairs.push(("created__lt".to_string(), before.to_rfc3339()));
        }
        if let Some(before) = self.updated_before {
            pairs.push(("updated__lt".to_string(), before.to_rfc3339()));
        }
        pairs
    }
}

/// Storage abstraction over the REST state store.
///
/// ## CAS semantics
///
/// [`NodeStore::update`] with an expected state is the core primitive for
/// distributed correctness: conflicting writers lose with
/// [`CasOutcome::StateMismatch`], re-read, and reconcile. Every
/// transition routine in the engine is written to be idempotent so that
/// losing a race is always safe.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Creates a node and returns it with the store-assigned id and
    /// timestamps.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::Error::ParentClosed`] if the parent no
    /// longer accepts children (invariant: a `closing` parent rejects new
    /// children).
    async fn create(&self, node: Node) -> Result<Node>;

    /// Gets a node by id. Returns `None` if it does not exist.
    async fn get(&self, id: &NodeId) -> Result<Option<Node>>;

    /// Lists nodes matching a filter.
    async fn find(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Writes a node back, optionally guarded by an expected prior state.
    ///
    /// With `expected_state = None` the write is unconditional (used for
    /// artifact/data updates that do not change state).
    async fn update(&self, node: &Node, expected_state: Option<NodeState>) -> Result<CasOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_revision_fields() {
        let node = Node::checkout("mainline", "master", "abc", "url");
        assert!(NodeFilter::new().tree("mainline").matches(&node));
        assert!(!NodeFilter::new().tree("next").matches(&node));
        assert!(NodeFilter::new()
            .tree("mainline")
            .branch("master")
            .state(NodeState::Running)
            .matches(&node));
    }

    #[test]
    fn filter_multiple_states_match_any() {
        let node = Node::checkout("mainline", "master", "abc", "url");
        let filter = NodeFilter::new()
            .state(NodeState::Available)
            .state(NodeState::Running);
        assert!(filter.matches(&node));
    }

    #[test]
    fn query_pairs_use_dotted_paths_and_suffixes() {
        let instant = Utc::now();
        let pairs = NodeFilter::new()
            .tree("stable")
            .created_after(instant)
            .processed_by_reporting(false)
            .to_query_pairs();
        assert!(pairs.contains(&("data.kernel_revision.tree".to_string(), "stable".to_string())));
        assert!(pairs
            .iter()
            .any(|(k, _)| k == "created__gt"));
        assert!(pairs.contains(&(
            "data.processed_by_reporting".to_string(),
            "false".to_string()
        )));
    }
}
