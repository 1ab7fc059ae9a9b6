//! The scheduler.
//!
//! Subscribes to the `node` topic and turns events into work: each
//! scheduler entry pairs an event pattern with a job definition and a
//! runtime/platform set. When an event matches, the job's rules are
//! evaluated against the triggering node and a child node is created per
//! eligible platform.
//!
//! Creation and dispatch are decoupled through the bus: the scheduler
//! only *creates* job nodes when entries match, and *dispatches* any
//! freshly created job node that names one of its runtimes. Retry
//! siblings and user-requested retries therefore flow through exactly
//! the same dispatch path as first attempts.
//!
//! Duplicate event delivery is tolerated by querying for an existing
//! child with the same (parent, name, platform) before creating one.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Semaphore;

use quern_core::config::{
    EventPattern, JobConfig, PipelineConfig, RuntimeKind, SchedulerEntry,
};
use quern_core::{Node, NodeKind, NodeResult, NodeState};

use crate::bus::{EventBus, EventOp, NodeEvent, NODE_CHANNEL};
use crate::error::{Error, Result};
use crate::results;
use crate::retry::{ensure_retry_sibling, wants_retry};
use crate::rules::{jobfilter_matches, CompiledRules};
use crate::runtime::{JobHandle, JobRenderer, JobStatus, RenderedJob, Runtime};
use crate::service::{drain_tasks, ShutdownSignal, DRAIN_GRACE};
use crate::store::{CasOutcome, NodeFilter, NodeStore};

const WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Returns true when every present pattern field equals the event's
/// value.
#[must_use]
pub fn pattern_matches(pattern: &EventPattern, event: &NodeEvent) -> bool {
    if pattern.channel != NODE_CHANNEL {
        return false;
    }
    if let Some(name) = &pattern.name {
        if name != &event.name {
            return false;
        }
    }
    if let Some(kind) = pattern.kind {
        if kind != event.kind {
            return false;
        }
    }
    if let Some(state) = pattern.state {
        if state != event.state {
            return false;
        }
    }
    if let Some(result) = pattern.result {
        if event.result != Some(result) {
            return false;
        }
    }
    true
}

struct RuntimeSlot {
    runtime: Arc<dyn Runtime>,
    permits: Arc<Semaphore>,
}

/// The scheduler service.
pub struct SchedulerService {
    config: Arc<PipelineConfig>,
    store: Arc<dyn NodeStore>,
    bus: Arc<dyn EventBus>,
    renderer: Arc<dyn JobRenderer>,
    runtimes: BTreeMap<String, RuntimeSlot>,
    compiled: BTreeMap<String, CompiledRules>,
    holdoff: Duration,
    watchers: tokio::sync::Mutex<tokio::task::JoinSet<()>>,
}

impl SchedulerService {
    /// Builds the scheduler from configuration and loaded runtime
    /// adapters.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a job definition carries an
    /// unparseable rule.
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn NodeStore>,
        bus: Arc<dyn EventBus>,
        renderer: Arc<dyn JobRenderer>,
        adapters: Vec<Arc<dyn Runtime>>,
    ) -> Result<Self> {
        let mut compiled = BTreeMap::new();
        for (name, job) in &config.jobs {
            compiled.insert(name.clone(), CompiledRules::compile(&job.rules)?);
        }

        let mut runtimes = BTreeMap::new();
        for adapter in adapters {
            let pool_size = config
                .runtimes
                .get(adapter.name())
                .map_or(4, |c| c.pool_size);
            runtimes.insert(
                adapter.name().to_string(),
                RuntimeSlot {
                    runtime: adapter,
                    permits: Arc::new(Semaphore::new(pool_size)),
                },
            );
        }

        let holdoff = Duration::minutes(config.tarball.holdoff_minutes);
        Ok(Self {
            config,
            store,
            bus,
            renderer,
            runtimes,
            compiled,
            holdoff,
            watchers: tokio::sync::Mutex::new(tokio::task::JoinSet::new()),
        })
    }

    /// Runs the event loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns bus errors that persist after the subscription is lost.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut subscription = self.bus.subscribe(NODE_CHANNEL).await?;
        tracing::info!("scheduler listening for node events");

        loop {
            tokio::select! {
                () = shutdown.triggered() => {
                    tracing::info!("scheduler shutting down");
                    self.drain().await;
                    return Ok(());
                }
                event = subscription.next() => {
                    match event? {
                        Some(event) => {
                            if let Err(err) = self.handle_event(&event).await {
                                tracing::error!(node = %event.id, error = %err, "event handling failed");
                            }
                        }
                        None => {
                            tracing::info!("event subscription ended");
                            self.drain().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Waits for outstanding result watchers, bounded by the drain
    /// grace period. Watchers still running after the window are
    /// aborted; the timeout sweep later expires their nodes.
    pub async fn drain(&self) {
        let mut watchers = self.watchers.lock().await;
        drain_tasks(&mut watchers, DRAIN_GRACE).await;
    }

    /// Handles one node event: creates children for matching entries,
    /// and dispatches freshly created job nodes addressed to one of this
    /// scheduler's runtimes.
    pub async fn handle_event(&self, event: &NodeEvent) -> Result<()> {
        let matching: Vec<&SchedulerEntry> = self
            .config
            .scheduler
            .iter()
            .filter(|entry| pattern_matches(&entry.event, event))
            .collect();

        if !matching.is_empty() {
            let Some(node) = self.store.get(&event.id).await? else {
                return Err(Error::NodeNotFound {
                    id: event.id.clone(),
                });
            };
            for entry in matching {
                if let Err(err) = self.schedule_entry(entry, &node).await {
                    tracing::error!(job = %entry.job, node = %node.id, error = %err, "scheduling failed");
                }
            }
        }

        if event.op == EventOp::Created
            && matches!(event.kind, NodeKind::Kbuild | NodeKind::Job)
        {
            self.maybe_dispatch(&event.id).await?;
        }

        Ok(())
    }

    /// Creates child nodes for one matching entry.
    async fn schedule_entry(&self, entry: &SchedulerEntry, node: &Node) -> Result<()> {
        let Some(job) = self.config.jobs.get(&entry.job) else {
            return Err(Error::Render {
                job: entry.job.clone(),
                message: "no such job definition".to_string(),
            });
        };

        if let Some(filter) = &node.jobfilter {
            if !filter.is_empty() && !jobfilter_matches(filter, &entry.job) {
                tracing::debug!(job = %entry.job, node = %node.id, "filtered by jobfilter");
                return Ok(());
            }
        }

        let rules = self.compiled.get(&entry.job);
        if let Some(rules) = rules {
            if !rules.eligible(node) {
                tracing::debug!(job = %entry.job, node = %node.id, "rules not satisfied");
                return Ok(());
            }
            if let Some(window) = rules.frequency() {
                if self.ran_recently(&entry.job, node, window).await? {
                    tracing::debug!(job = %entry.job, node = %node.id, "within frequency window");
                    return Ok(());
                }
            }
        }

        let Some(runtime_name) = entry
            .runtimes
            .iter()
            .find(|name| self.runtimes.contains_key(name.as_str()))
        else {
            tracing::debug!(job = %entry.job, "no loaded runtime for entry");
            return Ok(());
        };

        if entry.platforms.is_empty() {
            self.create_job_node(&entry.job, job, node, runtime_name, None)
                .await?;
        } else {
            for platform in &entry.platforms {
                self.create_job_node(&entry.job, job, node, runtime_name, Some(platform))
                    .await?;
            }
        }
        Ok(())
    }

    async fn ran_recently(&self, job_name: &str, node: &Node, window: Duration) -> Result<bool> {
        let Some((tree, branch)) = node.tree_branch() else {
            return Ok(false);
        };
        let prior = self
            .store
            .find(
                &NodeFilter::new()
                    .name(job_name)
                    .tree(tree)
                    .branch(branch)
                    .created_after(Utc::now() - window),
            )
            .await?;
        Ok(!prior.is_empty())
    }

    /// Creates one job node, enforcing single-writer semantics per
    /// (parent, name, platform) by aborting when a matching child
    /// already exists.
    async fn create_job_node(
        &self,
        job_name: &str,
        job: &JobConfig,
        parent: &Node,
        runtime_name: &str,
        platform: Option<&String>,
    ) -> Result<()> {
        let existing = self
            .store
            .find(&NodeFilter::new().parent(parent.id.clone()).name(job_name))
            .await?;
        let duplicate = existing.iter().any(|child| {
            child.data.platform.as_deref() == platform.map(String::as_str)
                && child.data.retry_counter == 0
        });
        if duplicate {
            tracing::debug!(job = %job_name, parent = %parent.id, "child already exists");
            return Ok(());
        }

        let mut child = Node::child_of(parent, job.kind, job_name);
        child.group = Some(job_name.to_string());
        child.data.runtime = Some(runtime_name.to_string());
        if let Some(platform) = platform {
            child.data.platform = Some(platform.clone());
            if let Some(config) = self.config.platforms.get(platform) {
                child.data.arch = Some(config.arch.clone());
            }
        }
        if let Some(arch) = job.params.get("arch") {
            child.data.arch = Some(arch.clone());
        }
        if let Some(compiler) = job.params.get("compiler") {
            child.data.compiler = Some(compiler.clone());
        }
        if let Some(defconfig) = job.params.get("defconfig") {
            child.data.defconfig = Some(defconfig.clone());
        }
        if let Some(fragments) = job.params.get("fragments") {
            child.data.fragments = fragments
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }
        child.data.config_full = child.data.defconfig.as_ref().map(|defconfig| {
            if child.data.fragments.is_empty() {
                defconfig.clone()
            } else {
                format!("{defconfig}+{}", child.data.fragments.join("+"))
            }
        });

        match self.store.create(child).await {
            Ok(created) => {
                tracing::info!(
                    node = %created.id,
                    job = %job_name,
                    runtime = %runtime_name,
                    platform = platform.map(String::as_str).unwrap_or("-"),
                    "created job node"
                );
                Ok(())
            }
            Err(Error::ParentClosed { parent, state }) => {
                // The event raced with the reconciler; nothing to do.
                tracing::debug!(%parent, %state, job = %job_name, "parent closed before scheduling");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Dispatches a freshly created job node if it is addressed to one
    /// of this scheduler's runtimes and not yet submitted.
    async fn maybe_dispatch(&self, node_id: &quern_core::NodeId) -> Result<()> {
        let Some(node) = self.store.get(node_id).await? else {
            return Ok(());
        };
        if node.state != NodeState::Running || node.data.job_id.is_some() {
            return Ok(());
        }
        let Some(runtime_name) = node.data.runtime.clone() else {
            return Ok(());
        };
        let Some(slot) = self.runtimes.get(&runtime_name) else {
            return Ok(());
        };
        let Some(job) = self.config.jobs.get(&node.name) else {
            tracing::warn!(node = %node.id, name = %node.name, "no job definition for node");
            return Ok(());
        };

        let params = self.assemble_params(job, &node, &runtime_name);
        let rendered = self.renderer.render(&node.name, job, &params).await?;

        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::submission(&runtime_name, "runtime pool closed"))?;

        match slot.runtime.submit(&rendered, &node).await {
            Ok(handle) => {
                self.record_submission(&node, &handle).await?;
                let status = slot.runtime.poll(&handle).await.unwrap_or(JobStatus::Running);
                if status == JobStatus::External {
                    drop(permit);
                } else {
                    self.spawn_watcher(Arc::clone(&slot.runtime), node, handle, permit)
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                drop(permit);
                tracing::warn!(node = %node.id, runtime = %runtime_name, error = %err, "submission failed");
                self.fail_submission(&node, &err).await
            }
        }
    }

    fn assemble_params(
        &self,
        job: &JobConfig,
        node: &Node,
        runtime_name: &str,
    ) -> BTreeMap<String, String> {
        let mut params = job.params.clone();
        if let Some(platform) = node
            .data
            .platform
            .as_ref()
            .and_then(|p| self.config.platforms.get(p))
        {
            for (key, value) in &platform.params {
                params.insert(key.clone(), value.clone());
            }
        }
        if let Some(revision) = &node.data.kernel_revision {
            params.insert("tree".to_string(), revision.tree.clone());
            params.insert("branch".to_string(), revision.branch.clone());
            params.insert("commit".to_string(), revision.commit.clone());
            params.insert("url".to_string(), revision.url.clone());
            if let Some(describe) = &revision.describe {
                params.insert("describe".to_string(), describe.clone());
            }
        }
        if let Some(arch) = &node.data.arch {
            params.insert("arch".to_string(), arch.clone());
        }
        if let Some(platform) = &node.data.platform {
            params.insert("platform".to_string(), platform.clone());
        }
        params.insert("node_id".to_string(), node.id.to_string());

        // Callback-driven labs need to know where to post results and
        // which public token description the submission carries.
        let runtime_config = self.config.runtimes.get(runtime_name);
        let callback_driven = runtime_config
            .map(|c| matches!(c.lab_type, RuntimeKind::Lava | RuntimeKind::Pull))
            .unwrap_or(false);
        if callback_driven {
            if let Some(base) = &self.config.api.callback_url {
                params.insert(
                    "callback_url".to_string(),
                    format!("{}/callback/{runtime_name}", base.trim_end_matches('/')),
                );
            }
            if let Some(token) = runtime_config.and_then(|c| c.notify_token.clone()) {
                params.insert("callback_token".to_string(), token);
            }
        }
        params
    }

    async fn record_submission(&self, node: &Node, handle: &JobHandle) -> Result<()> {
        let Some(mut current) = self.store.get(&node.id).await? else {
            return Ok(());
        };
        if current.data.job_id.is_some() {
            return Ok(());
        }
        current.data.job_id = Some(handle.job_id.clone());
        match self.store.update(&current, Some(NodeState::Running)).await? {
            CasOutcome::Updated(_) => Ok(()),
            CasOutcome::StateMismatch { actual } => {
                // Timed out before the submission was recorded; the
                // reconciler already owns this node.
                tracing::warn!(node = %node.id, %actual, "node moved before submission record");
                Ok(())
            }
        }
    }

    /// Marks a node incomplete after a submission failure and spawns the
    /// retry sibling; the sibling's created event re-enters dispatch.
    async fn fail_submission(&self, node: &Node, err: &Error) -> Result<()> {
        let Some(mut current) = self.store.get(&node.id).await? else {
            return Ok(());
        };
        if current.is_terminal() {
            return Ok(());
        }
        current.set_result(NodeResult::Incomplete)?;
        current.data.error_code = Some("submit_error".to_string());
        current.data.error_msg = Some(err.to_string());
        current.transition(NodeState::Done)?;

        match self.store.update(&current, Some(NodeState::Running)).await? {
            CasOutcome::Updated(updated) => {
                if wants_retry(&updated) {
                    ensure_retry_sibling(self.store.as_ref(), &updated).await?;
                }
                Ok(())
            }
            CasOutcome::StateMismatch { .. } => Ok(()),
        }
    }

    /// Polls a submitted job to completion and applies its results. The
    /// task is tracked so shutdown can drain it.
    async fn spawn_watcher(
        &self,
        runtime: Arc<dyn Runtime>,
        node: Node,
        handle: JobHandle,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let store = Arc::clone(&self.store);
        let holdoff = self.holdoff;
        let mut watchers = self.watchers.lock().await;
        // Reap watchers that already finished so the set stays small.
        while watchers.try_join_next().is_some() {}
        watchers.spawn(async move {
            let _permit = permit;
            loop {
                if Utc::now() >= node.timeout {
                    // The reconciler owns expiry; stop watching.
                    tracing::debug!(node = %node.id, "watcher stopped at node timeout");
                    return;
                }
                match runtime.poll(&handle).await {
                    Ok(status) if status.is_terminal() => {
                        let outcome = async {
                            let raw = runtime.collect(&handle).await?;
                            let payload = runtime.ingest_result(&node, &raw)?;
                            results::apply_results(store.as_ref(), &node, &payload, holdoff).await
                        }
                        .await;
                        if let Err(err) = outcome {
                            tracing::error!(node = %node.id, error = %err, "result ingestion failed");
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(node = %node.id, error = %err, "poll failed");
                    }
                }
                tokio::time::sleep(WATCH_INTERVAL).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ParamRenderer;
    use crate::store::memory::MemoryStore;
    use quern_core::config::{JobRules, RuntimeConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Runtime double whose submissions can be scripted to fail.
    struct ScriptedRuntime {
        name: String,
        fail_submissions: AtomicUsize,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_submissions: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn fail_next(&self, count: usize) {
            self.fail_submissions.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Runtime for ScriptedRuntime {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Lava
        }

        async fn submit(&self, job: &RenderedJob, _node: &Node) -> Result<JobHandle> {
            let remaining = self.fail_submissions.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_submissions.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::submission(&self.name, "lab unreachable"));
            }
            let mut submitted = self.submitted.lock().await;
            submitted.push(job.name.clone());
            Ok(JobHandle {
                runtime: self.name.clone(),
                job_id: format!("job-{}", submitted.len()),
            })
        }

        async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(JobStatus::External)
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
            Ok(())
        }

        async fn collect(&self, _handle: &JobHandle) -> Result<serde_json::Value> {
            Err(Error::submission(&self.name, "external"))
        }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.trees.insert(
            "mainline".to_string(),
            quern_core::config::TreeConfig {
                url: "https://example.org/linux.git".to_string(),
            },
        );
        config.runtimes.insert(
            "lab-1".to_string(),
            RuntimeConfig {
                lab_type: RuntimeKind::Lava,
                url: Some("https://lab.example.org".to_string()),
                image: None,
                context: None,
                notify_token: Some("lab-1-callback".to_string()),
                pool_size: 2,
            },
        );
        config.jobs.insert(
            "kbuild-gcc-12-arm64".to_string(),
            JobConfig {
                template: "kbuild.jinja2".to_string(),
                kind: NodeKind::Kbuild,
                image: None,
                params: BTreeMap::from([
                    ("arch".to_string(), "arm64".to_string()),
                    ("compiler".to_string(), "gcc-12".to_string()),
                    ("defconfig".to_string(), "defconfig".to_string()),
                ]),
                rules: JobRules::default(),
            },
        );
        config.scheduler.push(SchedulerEntry {
            job: "kbuild-gcc-12-arm64".to_string(),
            event: EventPattern {
                channel: NODE_CHANNEL.to_string(),
                name: Some("checkout".to_string()),
                kind: None,
                state: Some(NodeState::Available),
                result: None,
            },
            runtimes: vec!["lab-1".to_string()],
            platforms: Vec::new(),
        });
        config
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        scheduler: SchedulerService,
        runtime: Arc<ScriptedRuntime>,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let runtime = ScriptedRuntime::new("lab-1");
        let scheduler = SchedulerService::new(
            Arc::new(config),
            Arc::clone(&store) as Arc<dyn NodeStore>,
            Arc::clone(&store) as Arc<dyn EventBus>,
            Arc::new(ParamRenderer),
            vec![Arc::clone(&runtime) as Arc<dyn Runtime>],
        )
        .unwrap();
        Fixture {
            store,
            scheduler,
            runtime,
        }
    }

    async fn available_checkout(store: &MemoryStore) -> Node {
        let mut checkout = store
            .create(Node::checkout(
                "mainline",
                "master",
                "abc123",
                "https://example.org/linux.git",
            ))
            .await
            .unwrap();
        checkout.transition(NodeState::Available).unwrap();
        checkout.holdoff = Some(Utc::now() + Duration::minutes(10));
        store.update(&checkout, None).await.unwrap().into_node().unwrap()
    }

    fn available_event(checkout: &Node) -> NodeEvent {
        NodeEvent::for_node(EventOp::Updated, checkout)
    }

    #[tokio::test]
    async fn matching_event_creates_one_child() {
        let fx = fixture(test_config());
        let checkout = available_checkout(&fx.store).await;

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();

        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        let child = &children[0];
        assert_eq!(child.kind, NodeKind::Kbuild);
        assert_eq!(child.data.arch.as_deref(), Some("arm64"));
        assert_eq!(child.data.compiler.as_deref(), Some("gcc-12"));
        assert_eq!(child.data.runtime.as_deref(), Some("lab-1"));
        assert_eq!(
            child.data.kernel_revision.as_ref().map(|r| r.commit.as_str()),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn duplicate_event_creates_no_second_child() {
        let fx = fixture(test_config());
        let checkout = available_checkout(&fx.store).await;
        let event = available_event(&checkout);

        fx.scheduler.handle_event(&event).await.unwrap();
        fx.scheduler.handle_event(&event).await.unwrap();

        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn jobfilter_gates_scheduling() {
        let fx = fixture(test_config());
        let mut checkout = available_checkout(&fx.store).await;
        checkout.jobfilter = Some(vec!["kselftest-*".to_string()]);
        let checkout = fx
            .store
            .update(&checkout, None)
            .await
            .unwrap()
            .into_node()
            .unwrap();

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();

        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn rule_mismatch_skips_job() {
        let mut config = test_config();
        config
            .jobs
            .get_mut("kbuild-gcc-12-arm64")
            .unwrap()
            .rules
            .tree = vec!["next".to_string()];
        let fx = fixture(config);
        let checkout = available_checkout(&fx.store).await;

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();

        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn created_job_node_is_dispatched() {
        let fx = fixture(test_config());
        let checkout = available_checkout(&fx.store).await;

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();
        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        let child = &children[0];

        fx.scheduler
            .handle_event(&NodeEvent::for_node(EventOp::Created, child))
            .await
            .unwrap();

        let dispatched = fx.store.get(&child.id).await.unwrap().unwrap();
        assert_eq!(dispatched.data.job_id.as_deref(), Some("job-1"));
        assert_eq!(fx.runtime.submitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_per_node() {
        let fx = fixture(test_config());
        let checkout = available_checkout(&fx.store).await;

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();
        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        let created = NodeEvent::for_node(EventOp::Created, &children[0]);

        fx.scheduler.handle_event(&created).await.unwrap();
        fx.scheduler.handle_event(&created).await.unwrap();

        assert_eq!(fx.runtime.submitted.lock().await.len(), 1);
    }

    /// Runtime double completing instantly through the polling path.
    struct PolledRuntime;

    #[async_trait::async_trait]
    impl Runtime for PolledRuntime {
        fn name(&self) -> &str {
            "shell-local"
        }

        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Shell
        }

        async fn submit(&self, _job: &RenderedJob, _node: &Node) -> Result<JobHandle> {
            Ok(JobHandle {
                runtime: "shell-local".to_string(),
                job_id: "local-1".to_string(),
            })
        }

        async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(JobStatus::Succeeded)
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
            Ok(())
        }

        async fn collect(&self, _handle: &JobHandle) -> Result<serde_json::Value> {
            Ok(serde_json::json!({
                "job_id": "local-1",
                "result": "pass",
            }))
        }
    }

    #[tokio::test]
    async fn drain_lands_polled_results_before_shutdown() {
        let mut config = test_config();
        config.runtimes.insert(
            "shell-local".to_string(),
            RuntimeConfig {
                lab_type: RuntimeKind::Shell,
                url: None,
                image: None,
                context: None,
                notify_token: None,
                pool_size: 2,
            },
        );
        config.scheduler[0].runtimes = vec!["shell-local".to_string()];

        let store = Arc::new(MemoryStore::new());
        let scheduler = SchedulerService::new(
            Arc::new(config),
            Arc::clone(&store) as Arc<dyn NodeStore>,
            Arc::clone(&store) as Arc<dyn EventBus>,
            Arc::new(ParamRenderer),
            vec![Arc::new(PolledRuntime) as Arc<dyn Runtime>],
        )
        .unwrap();

        let checkout = available_checkout(&store).await;
        scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();
        let children = store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        scheduler
            .handle_event(&NodeEvent::for_node(EventOp::Created, &children[0]))
            .await
            .unwrap();

        // The watcher is still in flight; drain waits for it to apply
        // the collected results before shutdown proceeds.
        scheduler.drain().await;

        let kbuild = store.get(&children[0].id).await.unwrap().unwrap();
        assert_eq!(kbuild.data.job_id.as_deref(), Some("local-1"));
        assert_eq!(kbuild.state, NodeState::Available);
        assert_eq!(kbuild.result, Some(NodeResult::Pass));
    }

    #[tokio::test]
    async fn submission_failure_spawns_retry_chain() {
        let fx = fixture(test_config());
        let checkout = available_checkout(&fx.store).await;
        fx.runtime.fail_next(1);

        fx.scheduler
            .handle_event(&available_event(&checkout))
            .await
            .unwrap();
        let children = fx
            .store
            .find(&NodeFilter::new().parent(checkout.id.clone()))
            .await
            .unwrap();
        let first = children[0].clone();

        fx.scheduler
            .handle_event(&NodeEvent::for_node(EventOp::Created, &first))
            .await
            .unwrap();

        let failed = fx.store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(failed.state, NodeState::Done);
        assert_eq!(failed.result, Some(NodeResult::Incomplete));
        assert_eq!(failed.data.error_code.as_deref(), Some("submit_error"));

        let siblings = fx
            .store
            .find(
                &NodeFilter::new()
                    .parent(checkout.id.clone())
                    .name("kbuild-gcc-12-arm64"),
            )
            .await
            .unwrap();
        assert_eq!(siblings.len(), 2);
        let retry = siblings
            .iter()
            .find(|n| n.data.retry_counter == 1)
            .expect("retry sibling");

        // The sibling's created event dispatches it on the same path.
        fx.scheduler
            .handle_event(&NodeEvent::for_node(EventOp::Created, retry))
            .await
            .unwrap();
        let dispatched = fx.store.get(&retry.id).await.unwrap().unwrap();
        assert_eq!(dispatched.data.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn frequency_window_suppresses_rescheduling() {
        let mut config = test_config();
        config
            .jobs
            .get_mut("kbuild-gcc-12-arm64")
            .unwrap()
            .rules
            .frequency = Some("1d".to_string());
        let fx = fixture(config);

        let first = available_checkout(&fx.store).await;
        fx.scheduler
            .handle_event(&available_event(&first))
            .await
            .unwrap();

        let second = available_checkout(&fx.store).await;
        fx.scheduler
            .handle_event(&available_event(&second))
            .await
            .unwrap();

        let children = fx
            .store
            .find(&NodeFilter::new().parent(second.id.clone()))
            .await
            .unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn pattern_field_matching() {
        let node = Node::checkout("mainline", "master", "abc", "url");
        let event = NodeEvent::for_node(EventOp::Updated, &node);

        let mut pattern = EventPattern {
            channel: NODE_CHANNEL.to_string(),
            name: Some("checkout".to_string()),
            kind: Some(NodeKind::Checkout),
            state: Some(NodeState::Running),
            result: None,
        };
        assert!(pattern_matches(&pattern, &event));

        pattern.state = Some(NodeState::Available);
        assert!(!pattern_matches(&pattern, &event));

        pattern.state = None;
        pattern.result = Some(NodeResult::Pass);
        assert!(!pattern_matches(&pattern, &event));
    }
}
