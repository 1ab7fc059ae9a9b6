//! Pipeline configuration.
//!
//! Every service binary loads one TOML settings file (`--settings`) holding
//! the static catalog (trees, build configs, platforms, runtimes, job
//! definitions and scheduler entries) plus service endpoints and timings.
//! Secrets live in a separate file so the catalog can be committed to
//! version control.
//!
//! Configuration errors abort startup; running services never reload.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level settings for all pipeline services.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// State store / event bus endpoint.
    #[serde(default)]
    pub api: ApiSettings,
    /// Blob storage endpoint.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Downstream reporting sink.
    #[serde(default)]
    pub reporting: ReportingSettings,
    /// Trigger service settings.
    #[serde(default)]
    pub trigger: TriggerSettings,
    /// Timeout service settings.
    #[serde(default)]
    pub timeout: TimeoutSettings,
    /// Tarball service settings.
    #[serde(default)]
    pub tarball: TarballSettings,
    /// Source trees, keyed by tree name.
    #[serde(default)]
    pub trees: BTreeMap<String, TreeConfig>,
    /// Build configs, keyed by config name.
    #[serde(default)]
    pub build_configs: BTreeMap<String, BuildConfig>,
    /// Device platforms, keyed by platform name.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
    /// Execution runtimes, keyed by runtime name.
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeConfig>,
    /// Job definitions, keyed by job name.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    /// Scheduler entries mapping events to jobs and runtimes.
    #[serde(default)]
    pub scheduler: Vec<SchedulerEntry>,
}

impl PipelineConfig {
    /// Loads and validates settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed,
    /// or if cross-references between catalog sections are broken.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_source(format!("reading settings at {}", path.display()), e)
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            Error::configuration_with_source(format!("parsing settings at {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-references between catalog sections.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first broken reference.
    pub fn validate(&self) -> Result<()> {
        for (name, build) in &self.build_configs {
            if !self.trees.contains_key(&build.tree) {
                return Err(Error::configuration(format!(
                    "build config '{name}' references unknown tree '{}'",
                    build.tree
                )));
            }
        }
        for entry in &self.scheduler {
            if !self.jobs.contains_key(&entry.job) {
                return Err(Error::configuration(format!(
                    "scheduler entry references unknown job '{}'",
                    entry.job
                )));
            }
            for runtime in &entry.runtimes {
                if !self.runtimes.contains_key(runtime) {
                    return Err(Error::configuration(format!(
                        "scheduler entry for '{}' references unknown runtime '{runtime}'",
                        entry.job
                    )));
                }
            }
            for platform in &entry.platforms {
                if !self.platforms.contains_key(platform) {
                    return Err(Error::configuration(format!(
                        "scheduler entry for '{}' references unknown platform '{platform}'",
                        entry.job
                    )));
                }
            }
        }
        Ok(())
    }
}

/// State store / event bus endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the state store REST API.
    pub url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Public base URL of the pipeline's own callback endpoint, embedded
    /// in outgoing lab jobs.
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001".to_string(),
            timeout_secs: default_http_timeout_secs(),
            callback_url: None,
        }
    }
}

/// Blob storage endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Upload endpoint.
    pub upload_url: String,
    /// Public base URL artifacts are served from.
    pub download_url: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            upload_url: "http://localhost:8002/upload".to_string(),
            download_url: "http://localhost:8002/".to_string(),
        }
    }
}

/// Downstream reporting sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingSettings {
    /// Ingest endpoint URL.
    pub url: String,
    /// CI system identifier stamped on every submission.
    pub origin: String,
    /// Batch sweep period in seconds.
    #[serde(default = "default_forward_period_secs")]
    pub poll_period_secs: u64,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8003/submit".to_string(),
            origin: "quern".to_string(),
            poll_period_secs: default_forward_period_secs(),
        }
    }
}

/// Trigger service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSettings {
    /// Polling period in seconds; a single pass runs when zero.
    #[serde(default = "default_trigger_period_secs")]
    pub poll_period_secs: u64,
    /// Default frequency gate applied when a build config sets none.
    #[serde(default = "default_frequency")]
    pub default_frequency: String,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            poll_period_secs: default_trigger_period_secs(),
            default_frequency: default_frequency(),
        }
    }
}

/// Timeout service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    /// Sweep period in seconds.
    #[serde(default = "default_timeout_period_secs")]
    pub poll_period_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            poll_period_secs: default_timeout_period_secs(),
        }
    }
}

/// Tarball service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TarballSettings {
    /// Local mirror directory for kernel source trees.
    #[serde(default = "default_kdir")]
    pub kdir: String,
    /// Scratch directory for produced tarballs.
    #[serde(default = "default_output")]
    pub output: String,
    /// Holdoff granted to a checkout once its tarball is published,
    /// in minutes.
    #[serde(default = "default_holdoff_minutes")]
    pub holdoff_minutes: i64,
}

impl Default for TarballSettings {
    fn default() -> Self {
        Self {
            kdir: default_kdir(),
            output: default_output(),
            holdoff_minutes: default_holdoff_minutes(),
        }
    }
}

/// An upstream source tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Git URL of the tree.
    pub url: String,
}

/// A (tree, branch) pair watched by the trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Tree name; must exist in `trees`.
    pub tree: String,
    /// Branch to watch.
    pub branch: String,
    /// Frequency gate overriding the trigger default, e.g. `1d`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

/// A device platform jobs can target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// CPU architecture of the platform.
    pub arch: String,
    /// Boot method used by lab jobs, e.g. `u-boot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_method: Option<String>,
    /// Device-tree compatible strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatible: Vec<String>,
    /// Additional template parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// The kind of execution backend behind a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Local process execution.
    Shell,
    /// Local process inside a named container image.
    Docker,
    /// Container cluster pods.
    Kubernetes,
    /// LAVA lab with asynchronous callbacks.
    Lava,
    /// Lab that pulls work descriptors and posts results back.
    Pull,
}

/// An execution runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backend kind.
    pub lab_type: RuntimeKind,
    /// Lab or cluster endpoint, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Container image for docker runtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Kubernetes context/namespace selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Public description of the callback token embedded in outgoing
    /// jobs. The secret value lives in [`SecretsConfig`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_token: Option<String>,
    /// Maximum concurrent submissions to this runtime.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// A job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Template name handed to the job renderer.
    pub template: String,
    /// Node kind created for this job.
    pub kind: crate::node::NodeKind,
    /// Container image the job runs in, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Template parameters merged with node attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Eligibility rules evaluated against the triggering node.
    #[serde(default)]
    pub rules: JobRules,
}

/// Declarative eligibility rules for a job.
///
/// List entries follow the `name`, `name:branch`, `!name` grammar; see the
/// rule evaluator in `quern-pipeline` for the exact semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRules {
    /// Allowed/denied tree names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tree: Vec<String>,
    /// Allowed/denied branch names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch: Vec<String>,
    /// Inclusive minimum kernel version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<VersionBound>,
    /// Inclusive maximum kernel version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<VersionBound>,
    /// Allowed/denied architectures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arch: Vec<String>,
    /// Allowed/denied defconfigs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defconfig: Vec<String>,
    /// Allowed/denied config fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<String>,
    /// Minimum spacing between runs for the same (tree, branch),
    /// `[Nd][Nh][Nm]` grammar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

/// An inclusive kernel version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBound {
    /// Major version.
    pub version: u32,
    /// Patchlevel.
    pub patchlevel: u32,
}

/// The shape of node events a scheduler entry reacts to.
///
/// A node event matches when every present field equals the node's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    /// Bus topic, always `node` today.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Node name to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node kind to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<crate::node::NodeKind>,
    /// Node state to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<crate::node::NodeState>,
    /// Node result to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::node::NodeResult>,
}

/// One scheduler entry: when an event matching `event` arrives, run `job`
/// on each listed runtime/platform combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEntry {
    /// Job definition key.
    pub job: String,
    /// Event pattern gating this entry.
    pub event: EventPattern,
    /// Runtime names eligible to run the job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtimes: Vec<String>,
    /// Platform names to instantiate the job for. Empty means the job is
    /// platform-independent (one instance per event).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
}

/// Per-runtime secrets and signing keys, loaded from a separate file.
#[derive(Clone, Default, Deserialize)]
pub struct SecretsConfig {
    /// User token signing settings.
    #[serde(default)]
    pub jwt: JwtSecrets,
    /// Per-runtime tokens, keyed by runtime name.
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeSecrets>,
    /// Reporting sink credentials.
    #[serde(default)]
    pub reporting: ReportingSecrets,
}

impl SecretsConfig {
    /// Loads secrets from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_source(format!("reading secrets at {}", path.display()), e)
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::configuration_with_source(format!("parsing secrets at {}", path.display()), e)
        })
    }

    /// Maps a presented callback secret to the runtime it belongs to.
    #[must_use]
    pub fn runtime_for_callback_token(&self, token: &str) -> Option<&str> {
        self.runtimes
            .iter()
            .find(|(_, secrets)| secrets.callback_token.as_deref() == Some(token))
            .map(|(name, _)| name.as_str())
    }
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("jwt", &self.jwt)
            .field("runtimes", &self.runtimes.keys().collect::<Vec<_>>())
            .field("reporting", &self.reporting)
            .finish()
    }
}

/// User token signing secrets.
#[derive(Clone, Default, Deserialize)]
pub struct JwtSecrets {
    /// HS256 signing secret for user bearer tokens.
    #[serde(default)]
    pub secret: String,
    /// Expected issuer claim.
    #[serde(default)]
    pub issuer: Option<String>,
}

impl std::fmt::Debug for JwtSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSecrets")
            .field("secret", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Tokens for one runtime.
#[derive(Clone, Default, Deserialize)]
pub struct RuntimeSecrets {
    /// Token used to submit jobs to the lab.
    #[serde(default)]
    pub runtime_token: Option<String>,
    /// Secret the lab presents on its result callback.
    #[serde(default)]
    pub callback_token: Option<String>,
}

impl std::fmt::Debug for RuntimeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSecrets")
            .field(
                "runtime_token",
                &self.runtime_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "callback_token",
                &self.callback_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Reporting sink credentials.
#[derive(Clone, Default, Deserialize)]
pub struct ReportingSecrets {
    /// Bearer token for the ingest endpoint.
    #[serde(default)]
    pub token: Option<String>,
}

impl std::fmt::Debug for ReportingSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingSecrets")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn default_channel() -> String {
    "node".to_string()
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_forward_period_secs() -> u64 {
    180
}

fn default_trigger_period_secs() -> u64 {
    3600
}

fn default_timeout_period_secs() -> u64 {
    60
}

fn default_frequency() -> String {
    "1d".to_string()
}

fn default_holdoff_minutes() -> i64 {
    10
}

fn default_kdir() -> String {
    "/var/lib/quern/src".to_string()
}

fn default_output() -> String {
    "/var/lib/quern/output".to_string()
}

fn default_pool_size() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [api]
        url = "http://state-store:8001"

        [trees.mainline]
        url = "https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git"

        [build_configs.mainline-master]
        tree = "mainline"
        branch = "master"
        frequency = "1d"

        [platforms.qemu-x86]
        arch = "x86_64"

        [runtimes.k8s-gke]
        lab_type = "kubernetes"
        context = "gke-quern"

        [jobs.kbuild-gcc-12-x86]
        template = "kbuild.jinja2"
        kind = "kbuild"

        [jobs.kbuild-gcc-12-x86.rules]
        tree = ["mainline", "!android"]
        min_version = { version = 4, patchlevel = 19 }

        [[scheduler]]
        job = "kbuild-gcc-12-x86"
        event = { channel = "node", name = "checkout", state = "available" }
        runtimes = ["k8s-gke"]
    "#;

    #[test]
    fn sample_settings_parse() {
        let config: PipelineConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.url, "http://state-store:8001");
        assert_eq!(config.build_configs["mainline-master"].branch, "master");
        let job = &config.jobs["kbuild-gcc-12-x86"];
        assert_eq!(job.kind, crate::node::NodeKind::Kbuild);
        assert_eq!(job.rules.tree, vec!["mainline", "!android"]);
        assert_eq!(
            job.rules.min_version,
            Some(VersionBound {
                version: 4,
                patchlevel: 19
            })
        );
        let entry = &config.scheduler[0];
        assert_eq!(entry.event.name.as_deref(), Some("checkout"));
        assert_eq!(
            entry.event.state,
            Some(crate::node::NodeState::Available)
        );
    }

    #[test]
    fn unknown_job_reference_rejected() {
        let mut config: PipelineConfig = toml::from_str(SAMPLE).unwrap();
        config.scheduler[0].job = "no-such-job".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_tree_reference_rejected() {
        let mut config: PipelineConfig = toml::from_str(SAMPLE).unwrap();
        config
            .build_configs
            .get_mut("mainline-master")
            .unwrap()
            .tree = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_debug_is_redacted() {
        let secrets: SecretsConfig = toml::from_str(
            r#"
            [jwt]
            secret = "super-secret"

            [runtimes.lava-1]
            runtime_token = "lab-token"
            callback_token = "callback-secret"
            "#,
        )
        .unwrap();
        let debug = format!("{secrets:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("lab-token"));
        assert!(!debug.contains("callback-secret"));
    }

    #[test]
    fn callback_token_maps_to_runtime() {
        let secrets: SecretsConfig = toml::from_str(
            r#"
            [runtimes.lava-1]
            callback_token = "abc"

            [runtimes.lava-2]
            callback_token = "def"
            "#,
        )
        .unwrap();
        assert_eq!(secrets.runtime_for_callback_token("def"), Some("lava-2"));
        assert_eq!(secrets.runtime_for_callback_token("nope"), None);
    }
}
