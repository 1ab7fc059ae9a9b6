//! The result forwarder.
//!
//! Ships terminal nodes to the downstream reporting sink. Forwarding is
//! both event-driven (terminal-state events) and batched (a periodic
//! query catches anything the event path missed), giving at-least-once
//! delivery; the receiver deduplicates on node id.
//!
//! `processed_by_reporting` is the write-once gate: a node is either
//! forwarded exactly once or explicitly filtered (non-final retry
//! attempts), never both.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use quern_core::config::ReportingSettings;
use quern_core::{Node, NodeKind, NodeResult, NodeState};

use crate::bus::{EventBus, NodeEvent, NODE_CHANNEL};
use crate::error::{Error, Result};
use crate::retry::{ensure_retry_sibling, suppressed_from_reporting};
use crate::service::ShutdownSignal;
use crate::store::{NodeFilter, NodeStore};

const BATCH_WINDOW_DAYS: i64 = 4;
const SETTLE_MINUTES: i64 = 5;

/// A checkout entry in the downstream schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCheckout {
    /// Downstream id, `origin:node`.
    pub id: String,
    /// Origin identifier of this CI system.
    pub origin: String,
    /// Tree name.
    pub tree_name: String,
    /// Git repository URL.
    pub git_repository_url: String,
    /// Branch name.
    pub git_repository_branch: String,
    /// Commit hash.
    pub git_commit_hash: String,
    /// `git describe` of the commit, when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_name: Option<String>,
    /// Start time.
    pub start_time: chrono::DateTime<Utc>,
    /// Whether the checkout completed usable sources.
    pub valid: bool,
}

/// A build entry in the downstream schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBuild {
    /// Downstream id, `origin:node`.
    pub id: String,
    /// Origin identifier.
    pub origin: String,
    /// Parent checkout id.
    pub checkout_id: String,
    /// Target architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Compiler used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    /// Config name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    /// Whether the build succeeded.
    pub valid: bool,
    /// Log artifact URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

/// A test entry in the downstream schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTest {
    /// Downstream id, `origin:node`.
    pub id: String,
    /// Origin identifier.
    pub origin: String,
    /// Build the test ran against.
    pub build_id: String,
    /// Dotted test path.
    pub path: String,
    /// Outcome.
    pub status: String,
    /// Device the test ran on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Log artifact URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

/// A known failure signature derived from a log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportIssue {
    /// Downstream id.
    pub id: String,
    /// Origin identifier.
    pub origin: String,
    /// Human-readable description.
    pub comment: String,
    /// Log the issue was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
}

/// An occurrence of an issue in a build or test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportIncident {
    /// Downstream id.
    pub id: String,
    /// Origin identifier.
    pub origin: String,
    /// The issue this incident belongs to.
    pub issue_id: String,
    /// The build exhibiting the issue, for kbuild nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    /// The test exhibiting the issue, for test nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
}

/// The batched document submitted downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    /// Checkout entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkouts: Vec<ReportCheckout>,
    /// Build entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builds: Vec<ReportBuild>,
    /// Test entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<ReportTest>,
    /// Issue entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ReportIssue>,
    /// Incident entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incidents: Vec<ReportIncident>,
}

impl Report {
    /// Returns true when nothing would be submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkouts.is_empty()
            && self.builds.is_empty()
            && self.tests.is_empty()
            && self.issues.is_empty()
            && self.incidents.is_empty()
    }
}

/// The downstream reporting sink.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Submits one batched document.
    async fn submit(&self, report: &Report) -> Result<()>;
}

/// HTTP reporting sink client.
#[derive(Debug, Clone)]
pub struct HttpReportSink {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpReportSink {
    /// Creates a sink client.
    ///
    /// # Errors
    ///
    /// Returns a reporting error if the HTTP client cannot be built.
    pub fn new(settings: &ReportingSettings, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Reporting {
                message: format!("building http client: {e}"),
            })?;
        Ok(Self {
            url: settings.url.clone(),
            token,
            client,
        })
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn submit(&self, report: &Report) -> Result<()> {
        let mut builder = self.client.post(&self.url).json(report);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|e| Error::Reporting {
            message: format!("submitting report: {e}"),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Reporting {
                message: format!("sink returned {status}"),
            });
        }
        Ok(())
    }
}

/// The forwarder service.
pub struct ForwarderService {
    settings: ReportingSettings,
    store: Arc<dyn NodeStore>,
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn ReportSink>,
}

impl ForwarderService {
    /// Builds the forwarder.
    #[must_use]
    pub fn new(
        settings: ReportingSettings,
        store: Arc<dyn NodeStore>,
        bus: Arc<dyn EventBus>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            settings,
            store,
            bus,
            sink,
        }
    }

    /// Runs the event loop with a periodic batch sweep until shutdown.
    ///
    /// # Errors
    ///
    /// Returns bus errors that persist after the subscription is lost.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut subscription = self.bus.subscribe(NODE_CHANNEL).await?;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.settings.poll_period_secs,
        ));
        tracing::info!("forwarding terminal nodes downstream");

        loop {
            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("forwarder shutting down");
                    return Ok(());
                }
                event = subscription.next() => {
                    match event? {
                        Some(event) => {
                            if event.state == NodeState::Done {
                                if let Err(err) = self.forward_by_id(&event.id).await {
                                    tracing::warn!(node = %event.id, error = %err, "forwarding deferred to batch");
                                }
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.batch().await {
                        tracing::error!(error = %err, "batch sweep failed");
                    }
                }
            }
        }
    }

    /// Forwards every settled terminal node the event path missed.
    ///
    /// # Errors
    ///
    /// Returns store failures; per-node sink failures are logged and
    /// retried on the next sweep.
    pub async fn batch(&self) -> Result<usize> {
        let now = Utc::now();
        let nodes = self
            .store
            .find(
                &NodeFilter::new()
                    .state(NodeState::Done)
                    .processed_by_reporting(false)
                    .created_after(now - Duration::days(BATCH_WINDOW_DAYS))
                    .updated_before(now - Duration::minutes(SETTLE_MINUTES)),
            )
            .await?;

        let mut forwarded = 0;
        for node in nodes {
            match self.forward_node(node).await {
                Ok(true) => forwarded += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(error = %err, "node left for next sweep"),
            }
        }
        Ok(forwarded)
    }

    async fn forward_by_id(&self, id: &quern_core::NodeId) -> Result<()> {
        let Some(node) = self.store.get(id).await? else {
            return Ok(());
        };
        if node.data.processed_by_reporting || !node.is_terminal() {
            return Ok(());
        }
        self.forward_node(node).await?;
        Ok(())
    }

    /// Forwards or filters one node. Returns true when submitted.
    ///
    /// # Errors
    ///
    /// Returns sink failures before the node is marked, preserving
    /// at-least-once delivery.
    pub async fn forward_node(&self, node: Node) -> Result<bool> {
        if node.data.processed_by_reporting {
            return Ok(false);
        }

        // Non-final retry attempts are filtered: marked as processed
        // without ever reaching the sink, with the next attempt spawned
        // if the scheduler has not done so already.
        if suppressed_from_reporting(&node) {
            tracing::debug!(node = %node.id, retry = node.data.retry_counter, "filtered retry attempt");
            ensure_retry_sibling(self.store.as_ref(), &node).await?;
            self.mark_processed(node).await?;
            return Ok(false);
        }

        let report = self.convert(&node);
        if report.is_empty() {
            self.mark_processed(node).await?;
            return Ok(false);
        }

        self.sink.submit(&report).await?;
        self.mark_processed(node).await?;
        Ok(true)
    }

    async fn mark_processed(&self, mut node: Node) -> Result<()> {
        node.data.processed_by_reporting = true;
        self.store.update(&node, None).await?;
        Ok(())
    }

    fn downstream_id(&self, node: &Node) -> String {
        format!("{}:{}", self.settings.origin, node.id)
    }

    fn parent_id(&self, node: &Node) -> String {
        node.parent.as_ref().map_or_else(
            || self.downstream_id(node),
            |parent| format!("{}:{parent}", self.settings.origin),
        )
    }

    /// Converts one node into the downstream document.
    fn convert(&self, node: &Node) -> Report {
        let mut report = Report::default();
        match node.kind {
            NodeKind::Checkout => {
                let Some(revision) = node.data.kernel_revision.as_ref() else {
                    return report;
                };
                report.checkouts.push(ReportCheckout {
                    id: self.downstream_id(node),
                    origin: self.settings.origin.clone(),
                    tree_name: revision.tree.clone(),
                    git_repository_url: revision.url.clone(),
                    git_repository_branch: revision.branch.clone(),
                    git_commit_hash: revision.commit.clone(),
                    git_commit_name: revision.describe.clone(),
                    start_time: node.created,
                    valid: node.result != Some(NodeResult::Fail),
                });
            }
            NodeKind::Kbuild => {
                report.builds.push(ReportBuild {
                    id: self.downstream_id(node),
                    origin: self.settings.origin.clone(),
                    checkout_id: self.parent_id(node),
                    architecture: node.data.arch.clone(),
                    compiler: node.data.compiler.clone(),
                    config_name: node.data.config_full.clone(),
                    valid: node.result == Some(NodeResult::Pass),
                    log_url: node.artifacts.get("log").cloned(),
                });
                self.attach_issues(node, &mut report);
            }
            NodeKind::Job | NodeKind::Test | NodeKind::Process => {
                report.tests.push(ReportTest {
                    id: self.downstream_id(node),
                    origin: self.settings.origin.clone(),
                    build_id: self.parent_id(node),
                    path: node.path_str(),
                    status: node
                        .result
                        .map_or_else(|| "unknown".to_string(), |r| r.to_string()),
                    platform: node.data.platform.clone(),
                    log_url: node.artifacts.get("log").cloned(),
                });
                self.attach_issues(node, &mut report);
            }
            // Regression records are internal bookkeeping.
            NodeKind::Regression => {}
        }
        report
    }

    /// Derives issue/incident entries for failed boot and build nodes
    /// from their recorded error and log artifacts.
    fn attach_issues(&self, node: &Node, report: &mut Report) {
        if node.result != Some(NodeResult::Fail) {
            return;
        }
        let boot_path = node.path.iter().skip(1).any(|p| p.starts_with("boot"));
        if node.kind != NodeKind::Kbuild && !boot_path {
            return;
        }

        let issue_id = format!("{}-issue", self.downstream_id(node));
        report.issues.push(ReportIssue {
            id: issue_id.clone(),
            origin: self.settings.origin.clone(),
            comment: node
                .data
                .error_msg
                .clone()
                .or_else(|| node.data.error_code.clone())
                .unwrap_or_else(|| format!("{} failed", node.name)),
            report_url: node.artifacts.get("log").cloned(),
        });

        let (build_id, test_id) = if node.kind == NodeKind::Kbuild {
            (Some(self.downstream_id(node)), None)
        } else {
            (None, Some(self.downstream_id(node)))
        };
        report.incidents.push(ReportIncident {
            id: format!("{}-incident", self.downstream_id(node)),
            origin: self.settings.origin.clone(),
            issue_id,
            build_id,
            test_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        reports: Mutex<Vec<Report>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ReportSink for MemorySink {
        async fn submit(&self, report: &Report) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Reporting {
                    message: "sink unavailable".to_string(),
                });
            }
            self.reports.lock().await.push(report.clone());
            Ok(())
        }
    }

    fn forwarder(store: &Arc<MemoryStore>, sink: &Arc<MemorySink>) -> ForwarderService {
        ForwarderService::new(
            ReportingSettings::default(),
            Arc::clone(store) as Arc<dyn NodeStore>,
            Arc::clone(store) as Arc<dyn EventBus>,
            Arc::clone(sink) as Arc<dyn ReportSink>,
        )
    }

    async fn terminal_checkout(store: &MemoryStore, result: NodeResult) -> Node {
        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        let mut done = store.get(&checkout.id).await.unwrap().unwrap();
        done.set_result(result).unwrap();
        done.transition(NodeState::Done).unwrap();
        store.update(&done, None).await.unwrap().into_node().unwrap()
    }

    #[tokio::test]
    async fn terminal_checkout_is_forwarded_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        let service = forwarder(&store, &sink);
        let checkout = terminal_checkout(&store, NodeResult::Pass).await;

        assert!(service.forward_node(checkout.clone()).await.unwrap());
        let marked = store.get(&checkout.id).await.unwrap().unwrap();
        assert!(marked.data.processed_by_reporting);

        // Second attempt is a no-op.
        assert!(!service.forward_node(marked).await.unwrap());
        assert_eq!(sink.reports.lock().await.len(), 1);

        let report = &sink.reports.lock().await[0];
        assert_eq!(report.checkouts.len(), 1);
        assert_eq!(report.checkouts[0].tree_name, "mainline");
        assert!(report.checkouts[0].valid);
    }

    #[tokio::test]
    async fn incomplete_kbuild_retry_is_filtered_not_forwarded() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        let service = forwarder(&store, &sink);

        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        let kbuild = store
            .create(Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-a"))
            .await
            .unwrap();
        let mut done = store.get(&kbuild.id).await.unwrap().unwrap();
        done.set_result(NodeResult::Incomplete).unwrap();
        done.transition(NodeState::Done).unwrap();
        let done = store.update(&done, None).await.unwrap().into_node().unwrap();

        assert!(!service.forward_node(done).await.unwrap());
        let marked = store.get(&kbuild.id).await.unwrap().unwrap();
        assert!(marked.data.processed_by_reporting);
        assert!(sink.reports.lock().await.is_empty());
    }

    #[tokio::test]
    async fn final_retry_attempt_is_forwarded() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        let service = forwarder(&store, &sink);

        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        let mut kbuild = Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-a");
        kbuild.data.retry_counter = crate::retry::MAX_RETRY_COUNTER;
        let kbuild = store.create(kbuild).await.unwrap();
        let mut done = store.get(&kbuild.id).await.unwrap().unwrap();
        done.set_result(NodeResult::Incomplete).unwrap();
        done.transition(NodeState::Done).unwrap();
        let done = store.update(&done, None).await.unwrap().into_node().unwrap();

        assert!(service.forward_node(done).await.unwrap());
        assert_eq!(sink.reports.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_leaves_node_unmarked() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let service = forwarder(&store, &sink);
        let checkout = terminal_checkout(&store, NodeResult::Pass).await;

        assert!(service.forward_node(checkout.clone()).await.is_err());
        let unmarked = store.get(&checkout.id).await.unwrap().unwrap();
        assert!(!unmarked.data.processed_by_reporting);
    }

    #[tokio::test]
    async fn failed_boot_test_carries_issue_and_incident() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        let service = forwarder(&store, &sink);

        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        let mut boot = Node::child_of(&checkout, NodeKind::Test, "boot-nfs");
        boot.data.error_msg = Some("kernel panic".to_string());
        boot.artifacts.insert(
            "log".to_string(),
            "https://blobs.example.org/boot.log".to_string(),
        );
        let boot = store.create(boot).await.unwrap();
        let mut done = store.get(&boot.id).await.unwrap().unwrap();
        done.set_result(NodeResult::Fail).unwrap();
        done.transition(NodeState::Done).unwrap();
        let done = store.update(&done, None).await.unwrap().into_node().unwrap();

        assert!(service.forward_node(done).await.unwrap());
        let reports = sink.reports.lock().await;
        let report = &reports[0];
        assert_eq!(report.tests.len(), 1);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.incidents.len(), 1);
        assert_eq!(report.issues[0].comment, "kernel panic");
        assert_eq!(report.incidents[0].test_id.as_deref(), Some(report.tests[0].id.as_str()));
    }

    #[tokio::test]
    async fn batch_sweeps_settled_nodes() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::default());
        let service = forwarder(&store, &sink);
        terminal_checkout(&store, NodeResult::Pass).await;

        // Freshly updated nodes have not settled yet.
        assert_eq!(service.batch().await.unwrap(), 0);
    }
}
