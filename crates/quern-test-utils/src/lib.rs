//! Shared fixtures for quern integration tests.
//!
//! Builders and canned configuration so tests describe scenarios, not
//! setup. Production code never depends on this crate.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::collections::BTreeMap;

use quern_core::config::{
    BuildConfig, EventPattern, JobConfig, JobRules, PipelineConfig, PlatformConfig, RuntimeConfig,
    RuntimeKind, SchedulerEntry, TreeConfig,
};
use quern_core::{Node, NodeKind, NodeResult, NodeState};
use quern_pipeline::error::Result;
use quern_pipeline::store::NodeStore;

/// Fluent builder over [`Node`] for test trees.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// Starts from a mainline checkout.
    #[must_use]
    pub fn checkout() -> Self {
        Self {
            node: Node::checkout(
                "mainline",
                "master",
                "184f1fe9b3cb",
                "https://git.example.org/linux.git",
            ),
        }
    }

    /// Starts from a child of `parent`.
    #[must_use]
    pub fn child_of(parent: &Node, kind: NodeKind, name: &str) -> Self {
        Self {
            node: Node::child_of(parent, kind, name),
        }
    }

    /// Overrides the revision commit.
    #[must_use]
    pub fn commit(mut self, commit: &str) -> Self {
        if let Some(rev) = self.node.data.kernel_revision.as_mut() {
            rev.commit = commit.to_string();
        }
        self
    }

    /// Sets the build fingerprint fields.
    #[must_use]
    pub fn build_params(mut self, arch: &str, compiler: &str, defconfig: &str) -> Self {
        self.node.data.arch = Some(arch.to_string());
        self.node.data.compiler = Some(compiler.to_string());
        self.node.data.defconfig = Some(defconfig.to_string());
        self.node.data.config_full = Some(defconfig.to_string());
        self
    }

    /// Sets the platform.
    #[must_use]
    pub fn platform(mut self, platform: &str) -> Self {
        self.node.data.platform = Some(platform.to_string());
        self
    }

    /// Sets the group label.
    #[must_use]
    pub fn group(mut self, group: &str) -> Self {
        self.node.group = Some(group.to_string());
        self
    }

    /// Sets the external job id.
    #[must_use]
    pub fn job_id(mut self, job_id: &str) -> Self {
        self.node.data.job_id = Some(job_id.to_string());
        self
    }

    /// Sets the retry counter.
    #[must_use]
    pub fn retry_counter(mut self, counter: u32) -> Self {
        self.node.data.retry_counter = counter;
        self
    }

    /// Sets the job filter.
    #[must_use]
    pub fn jobfilter(mut self, patterns: &[&str]) -> Self {
        self.node.jobfilter = Some(patterns.iter().map(ToString::to_string).collect());
        self
    }

    /// Returns the built node.
    #[must_use]
    pub fn build(self) -> Node {
        self.node
    }

    /// Creates the node in `store`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn create<S: NodeStore + ?Sized>(self, store: &S) -> Result<Node> {
        store.create(self.node).await
    }
}

/// Drives a stored node to `done` with the given result.
///
/// # Errors
///
/// Propagates store failures.
pub async fn finish<S: NodeStore + ?Sized>(
    store: &S,
    node: &Node,
    result: NodeResult,
) -> Result<Node> {
    let mut update = store
        .get(&node.id)
        .await?
        .expect("node must exist to be finished");
    update.set_result(result)?;
    update.transition(NodeState::Done)?;
    Ok(store
        .update(&update, None)
        .await?
        .into_node()
        .expect("unconditional update cannot lose"))
}

/// Marks a stored node `available` with the given holdoff offset in
/// minutes (negative = already elapsed).
///
/// # Errors
///
/// Propagates store failures.
pub async fn make_available<S: NodeStore + ?Sized>(
    store: &S,
    node: &Node,
    holdoff_minutes: i64,
) -> Result<Node> {
    let mut update = store
        .get(&node.id)
        .await?
        .expect("node must exist to become available");
    update.transition(NodeState::Available)?;
    update.holdoff = Some(chrono::Utc::now() + chrono::Duration::minutes(holdoff_minutes));
    Ok(store
        .update(&update, None)
        .await?
        .into_node()
        .expect("unconditional update cannot lose"))
}

/// A catalog with one tree, one kbuild job and one baseline job on a
/// LAVA runtime, mirroring the smallest real deployment.
#[must_use]
pub fn sample_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.trees.insert(
        "mainline".to_string(),
        TreeConfig {
            url: "https://git.example.org/linux.git".to_string(),
        },
    );
    config.build_configs.insert(
        "mainline-master".to_string(),
        BuildConfig {
            tree: "mainline".to_string(),
            branch: "master".to_string(),
            frequency: Some("1d".to_string()),
        },
    );
    config.platforms.insert(
        "bcm2711-rpi-4-b".to_string(),
        PlatformConfig {
            arch: "arm64".to_string(),
            boot_method: Some("u-boot".to_string()),
            compatible: vec!["brcm,bcm2711".to_string()],
            params: BTreeMap::new(),
        },
    );
    config.runtimes.insert(
        "lava-lab".to_string(),
        RuntimeConfig {
            lab_type: RuntimeKind::Lava,
            url: Some("https://lab.example.org".to_string()),
            image: None,
            context: None,
            notify_token: Some("lava-lab-callback".to_string()),
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
    config.jobs.insert(
        "baseline-arm64".to_string(),
        JobConfig {
            template: "baseline.jinja2".to_string(),
            kind: NodeKind::Job,
            image: None,
            params: BTreeMap::new(),
            rules: JobRules::default(),
        },
    );
    config.scheduler.push(SchedulerEntry {
        job: "kbuild-gcc-12-arm64".to_string(),
        event: EventPattern {
            channel: "node".to_string(),
            name: Some("checkout".to_string()),
            kind: None,
            state: Some(NodeState::Available),
            result: None,
        },
        runtimes: vec!["lava-lab".to_string()],
        platforms: Vec::new(),
    });
    config.scheduler.push(SchedulerEntry {
        job: "baseline-arm64".to_string(),
        event: EventPattern {
            channel: "node".to_string(),
            name: Some("kbuild-gcc-12-arm64".to_string()),
            kind: Some(NodeKind::Kbuild),
            state: Some(NodeState::Available),
            result: Some(NodeResult::Pass),
        },
        runtimes: vec!["lava-lab".to_string()],
        platforms: vec!["bcm2711-rpi-4-b".to_string()],
    });
    config
}

/// Signs a user bearer token for API tests.
#[must_use]
pub fn user_token(secret: &str, sub: &str) -> String {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    let claims = serde_json::json!({
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + 3600,
        "groups": ["kernel"],
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token signing cannot fail with a valid secret")
}
