//! The node model.
//!
//! A [`Node`] is the sole persistent entity in the pipeline. Nodes form a
//! tree rooted at a `checkout` (one per tested revision), with kernel
//! builds, test suites and test cases as descendants. Every service
//! coordinates exclusively by reading and writing nodes through the state
//! store; the store linearizes state transitions and the event bus fans
//! out change notifications.
//!
//! ## State machine
//!
//! Node states only ever advance:
//!
//! ```text
//! running ──► available ──► closing ──► done
//!     └──────────────────────────────────┘
//! ```
//!
//! A node in `running` or `available` may accept new children; a
//! `closing` node may not. A `done` node carries an immutable result.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::NodeId;

/// Default wall-clock budget for a node to reach `done`, set at creation.
pub const DEFAULT_TIMEOUT_HOURS: i64 = 6;

/// The kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Root node for a (tree, branch, commit) revision.
    Checkout,
    /// A kernel build.
    Kbuild,
    /// A test suite.
    Job,
    /// A single test case.
    Test,
    /// A post-processing step.
    Process,
    /// A recorded pass→fail transition.
    Regression,
}

impl NodeKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Kbuild => "kbuild",
            Self::Job => "job",
            Self::Test => "test",
            Self::Process => "process",
            Self::Regression => "regression",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Work is in progress; the node accepts children.
    Running,
    /// The node produced its artifacts and accepts children until holdoff.
    Available,
    /// No new children accepted; waiting for existing children to finish.
    Closing,
    /// Terminal. The result is final.
    Done,
}

impl NodeState {
    const fn ordinal(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Available => 1,
            Self::Closing => 2,
            Self::Done => 3,
        }
    }

    /// Returns true if a transition from `self` to `to` advances the
    /// monotone lifecycle sequence.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        to.ordinal() > self.ordinal()
    }

    /// Returns true if nodes in this state may accept new children.
    #[must_use]
    pub const fn accepts_children(self) -> bool {
        matches!(self, Self::Running | Self::Available)
    }

    /// Returns the wire name of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Available => "available",
            Self::Closing => "closing",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a terminal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeResult {
    /// The work succeeded.
    Pass,
    /// The work ran and failed.
    Fail,
    /// The work was skipped.
    Skip,
    /// The work did not run to completion.
    Incomplete,
}

impl NodeResult {
    /// Returns the wire name of this result.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for NodeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kernel revision a node tree was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRevision {
    /// Tree name, e.g. `mainline`.
    pub tree: String,
    /// Branch name, e.g. `master`.
    pub branch: String,
    /// Full commit hash of the tested revision.
    pub commit: String,
    /// Git URL the tree was fetched from.
    pub url: String,
    /// `git describe` output, resolved by the tarball service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
}

/// Structured node attributes.
///
/// Fields are populated progressively: the trigger sets the revision, the
/// scheduler copies build parameters from the parent and adds platform
/// attributes, runtime adapters record the external job id and error
/// details, and the forwarder flips `processed_by_reporting`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Kernel revision under test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_revision: Option<KernelRevision>,
    /// Target CPU architecture, e.g. `arm64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Compiler used for the build, e.g. `gcc-12`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    /// Kernel defconfig name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defconfig: Option<String>,
    /// Fully resolved config identifier (defconfig plus fragments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_full: Option<String>,
    /// Config fragments applied on top of the defconfig.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<String>,
    /// Device-type platform the job targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Specific device instance the job ran on, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Runtime the job was dispatched to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// External job id assigned by the runtime, used to route callbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Machine-readable error class for infrastructure failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Cross-link to the regression node recorded for this failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regression: Option<NodeId>,
    /// Retry ordinal of this node within its logical job (0 = first try).
    #[serde(default)]
    pub retry_counter: u32,
    /// Write-once marker set by the forwarder once the node has been
    /// reported downstream (or explicitly filtered).
    #[serde(default)]
    pub processed_by_reporting: bool,
    /// Lab-specific passthrough fields attached by callbacks.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The unit of persisted work state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier. Locally minted at construction; replaced by the
    /// state store's authoritative id on create.
    pub id: NodeId,
    /// The kind of work this node represents.
    pub kind: NodeKind,
    /// Job name; matches a job definition key for scheduled nodes.
    pub name: String,
    /// Ordered names from the root checkout to this node.
    pub path: Vec<String>,
    /// Parent node id; `None` only for checkouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    /// Optional group label used for querying related nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Lifecycle state.
    pub state: NodeState,
    /// Terminal outcome; `None` until known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NodeResult>,
    /// Structured attributes.
    #[serde(default)]
    pub data: NodeData,
    /// Artifact name → URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    /// Creation timestamp, maintained by the store.
    pub created: DateTime<Utc>,
    /// Last-update timestamp, maintained by the store.
    pub updated: DateTime<Utc>,
    /// Absolute deadline for reaching `done`. Set at creation, never
    /// extended.
    pub timeout: DateTime<Utc>,
    /// Grace period end while `available`; the node stays open to new
    /// children until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdoff: Option<DateTime<Utc>>,
    /// Job-name patterns selectively gating scheduling under this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobfilter: Option<Vec<String>>,
    /// Owning user, for user-submitted nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Submitting principal (service account or user).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    /// Groups the owner belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_groups: Vec<String>,
    /// Fingerprint of the (tree, branch, commit [, patches]) this node
    /// tree was created for; shared by the whole tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treeid: Option<String>,
}

impl Node {
    /// Creates a new root checkout node in `running` state.
    #[must_use]
    pub fn checkout(
        tree: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let revision = KernelRevision {
            tree: tree.into(),
            branch: branch.into(),
            commit: commit.into(),
            url: url.into(),
            describe: None,
        };
        Self {
            id: NodeId::generate(),
            kind: NodeKind::Checkout,
            name: "checkout".to_string(),
            path: vec!["checkout".to_string()],
            parent: None,
            group: None,
            state: NodeState::Running,
            result: None,
            data: NodeData {
                kernel_revision: Some(revision),
                ..NodeData::default()
            },
            artifacts: BTreeMap::new(),
            created: now,
            updated: now,
            timeout: now + Duration::hours(DEFAULT_TIMEOUT_HOURS),
            holdoff: None,
            jobfilter: None,
            owner: None,
            submitter: None,
            user_groups: Vec::new(),
            treeid: None,
        }
    }

    /// Creates a child node under `parent`, inheriting the revision,
    /// build parameters, tree fingerprint and job filter.
    #[must_use]
    pub fn child_of(parent: &Self, kind: NodeKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        let mut path = parent.path.clone();
        path.push(name.clone());
        Self {
            id: NodeId::generate(),
            kind,
            name,
            path,
            parent: Some(parent.id.clone()),
            group: parent.group.clone(),
            state: NodeState::Running,
            result: None,
            data: NodeData {
                kernel_revision: parent.data.kernel_revision.clone(),
                arch: parent.data.arch.clone(),
                compiler: parent.data.compiler.clone(),
                defconfig: parent.data.defconfig.clone(),
                config_full: parent.data.config_full.clone(),
                fragments: parent.data.fragments.clone(),
                platform: parent.data.platform.clone(),
                runtime: parent.data.runtime.clone(),
                ..NodeData::default()
            },
            artifacts: BTreeMap::new(),
            created: now,
            updated: now,
            timeout: now + Duration::hours(DEFAULT_TIMEOUT_HOURS),
            holdoff: None,
            jobfilter: parent.jobfilter.clone(),
            owner: parent.owner.clone(),
            submitter: None,
            user_groups: parent.user_groups.clone(),
            treeid: parent.treeid.clone(),
        }
    }

    /// Advances the lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if `to` does not advance the
    /// monotone sequence.
    pub fn transition(&mut self, to: NodeState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated = Utc::now();
        Ok(())
    }

    /// Assigns the terminal result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResultFinal`] if the node is already `done` with a
    /// different result.
    pub fn set_result(&mut self, result: NodeResult) -> Result<()> {
        if self.state == NodeState::Done {
            if let Some(existing) = self.result {
                if existing != result {
                    return Err(Error::ResultFinal {
                        node: self.id.to_string(),
                        result: existing.to_string(),
                    });
                }
            }
        }
        self.result = Some(result);
        self.updated = Utc::now();
        Ok(())
    }

    /// Returns true if the node is `done`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state == NodeState::Done
    }

    /// Returns the revision's (tree, branch) pair, when present.
    #[must_use]
    pub fn tree_branch(&self) -> Option<(&str, &str)> {
        self.data
            .kernel_revision
            .as_ref()
            .map(|rev| (rev.tree.as_str(), rev.branch.as_str()))
    }

    /// Returns the dotted path string, e.g. `checkout.kbuild-gcc-12-arm64`.
    #[must_use]
    pub fn path_str(&self) -> String {
        self.path.join(".")
    }
}

/// Computes the tree fingerprint shared by a checkout and its descendants.
///
/// Patch URLs participate so that a patchset checkout never collides with
/// the plain checkout it was derived from.
#[must_use]
pub fn tree_fingerprint(tree: &str, branch: &str, commit: &str, patch_urls: &[String]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(tree.as_bytes());
    hasher.update(b"\0");
    hasher.update(branch.as_bytes());
    hasher.update(b"\0");
    hasher.update(commit.as_bytes());
    for url in patch_urls {
        hasher.update(b"\0");
        hasher.update(url.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_is_monotone() {
        assert!(NodeState::Running.can_transition(NodeState::Available));
        assert!(NodeState::Running.can_transition(NodeState::Done));
        assert!(NodeState::Available.can_transition(NodeState::Closing));
        assert!(NodeState::Available.can_transition(NodeState::Done));
        assert!(NodeState::Closing.can_transition(NodeState::Done));

        assert!(!NodeState::Available.can_transition(NodeState::Running));
        assert!(!NodeState::Done.can_transition(NodeState::Closing));
        assert!(!NodeState::Done.can_transition(NodeState::Done));
    }

    #[test]
    fn closing_rejects_children() {
        assert!(NodeState::Running.accepts_children());
        assert!(NodeState::Available.accepts_children());
        assert!(!NodeState::Closing.accepts_children());
        assert!(!NodeState::Done.accepts_children());
    }

    #[test]
    fn checkout_has_no_parent() {
        let node = Node::checkout("mainline", "master", "abc123", "https://example.org/linux.git");
        assert_eq!(node.kind, NodeKind::Checkout);
        assert!(node.parent.is_none());
        assert_eq!(node.path, vec!["checkout"]);
        let rev = node.data.kernel_revision.unwrap();
        assert_eq!(rev.tree, "mainline");
        assert_eq!(rev.commit, "abc123");
    }

    #[test]
    fn child_inherits_revision_and_path() {
        let checkout = Node::checkout("next", "master", "def456", "https://example.org/next.git");
        let child = Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-x86");
        assert_eq!(child.parent.as_ref(), Some(&checkout.id));
        assert_eq!(child.path, vec!["checkout", "kbuild-gcc-12-x86"]);
        assert_eq!(
            child.data.kernel_revision.as_ref().map(|r| r.commit.as_str()),
            Some("def456")
        );
        assert_eq!(child.state, NodeState::Running);
    }

    #[test]
    fn transition_rejects_regression() {
        let mut node = Node::checkout("mainline", "master", "abc", "url");
        node.transition(NodeState::Available).unwrap();
        let err = node.transition(NodeState::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn result_is_immutable_once_done() {
        let mut node = Node::checkout("mainline", "master", "abc", "url");
        node.set_result(NodeResult::Pass).unwrap();
        node.transition(NodeState::Done).unwrap();
        assert!(node.set_result(NodeResult::Pass).is_ok());
        assert!(node.set_result(NodeResult::Fail).is_err());
    }

    #[test]
    fn fingerprint_depends_on_patches() {
        let plain = tree_fingerprint("stable", "linux-6.1.y", "abc", &[]);
        let patched = tree_fingerprint(
            "stable",
            "linux-6.1.y",
            "abc",
            &["https://example.org/p1.mbox".to_string()],
        );
        assert_ne!(plain, patched);
        assert_eq!(plain.len(), 64);
    }

    #[test]
    fn node_serializes_with_snake_case_states() {
        let node = Node::checkout("mainline", "master", "abc", "url");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["kind"], "checkout");
        assert!(json.get("result").is_none());
    }
}
