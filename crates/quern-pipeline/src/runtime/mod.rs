//! Runtime adapters.
//!
//! A runtime is a backend capable of executing a rendered job: a local
//! shell, a docker image, a container cluster, a LAVA lab, or a lab that
//! pulls work descriptors. Backends are modelled as one small capability
//! trait; adding a runtime means adding a variant, not a hierarchy.
//!
//! Submission is the only side effect a runtime performs on behalf of the
//! scheduler. Completion flows back either by polling ([`Runtime::poll`]
//! then [`Runtime::collect`]) or asynchronously through the callback
//! endpoint for [`JobStatus::External`] backends.

pub mod docker;
pub mod kubernetes;
pub mod lava;
pub mod pull;
pub mod shell;

use std::collections::BTreeMap;

use async_trait::async_trait;

use quern_core::config::{JobConfig, RuntimeKind};
use quern_core::Node;

use crate::error::{Error, Result};
use crate::results::ResultsPayload;

/// A job description rendered for submission.
#[derive(Debug, Clone)]
pub struct RenderedJob {
    /// Job definition name.
    pub name: String,
    /// Template the job was rendered from.
    pub template: String,
    /// Rendered document handed to the backend.
    pub content: String,
    /// The parameter dictionary the template was rendered with.
    pub params: BTreeMap<String, String>,
}

/// Handle to a submitted external job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Runtime the job was submitted to.
    pub runtime: String,
    /// Backend-assigned job id.
    pub job_id: String,
}

/// Execution status of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for the backend to start it.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully; results can be collected.
    Succeeded,
    /// Finished unsuccessfully; results can be collected.
    Failed,
    /// Completion is delivered asynchronously via the callback endpoint;
    /// polling carries no information.
    External,
}

impl JobStatus {
    /// Returns true once results can be collected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Capability interface over heterogeneous execution backends.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// The configured runtime name.
    fn name(&self) -> &str;

    /// The backend kind.
    fn kind(&self) -> RuntimeKind;

    /// Submits a rendered job on behalf of `node`.
    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle>;

    /// Reports the job's execution status.
    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Cancels a submitted job. Best effort.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Collects the raw completion payload once [`Runtime::poll`]
    /// reports a terminal status.
    async fn collect(&self, handle: &JobHandle) -> Result<serde_json::Value>;

    /// Translates the backend's completion payload into the common
    /// results shape.
    fn ingest_result(&self, node: &Node, payload: &serde_json::Value) -> Result<ResultsPayload> {
        let _ = node;
        crate::results::parse_runtime_payload(self.kind(), payload)
    }
}

/// The external job-template engine.
///
/// The engine only supplies parameter dictionaries drawn from the node
/// tree; rendering itself is a collaborator concern.
#[async_trait]
pub trait JobRenderer: Send + Sync {
    /// Renders the job `template` with `params`.
    async fn render(
        &self,
        name: &str,
        job: &JobConfig,
        params: &BTreeMap<String, String>,
    ) -> Result<RenderedJob>;
}

/// Renderer that hands the parameter dictionary through as a JSON
/// document.
///
/// Useful for tests and for backends whose submission format is exactly
/// the parameter set; production deployments plug the template engine in
/// behind [`JobRenderer`] instead.
#[derive(Debug, Clone, Default)]
pub struct ParamRenderer;

#[async_trait]
impl JobRenderer for ParamRenderer {
    async fn render(
        &self,
        name: &str,
        job: &JobConfig,
        params: &BTreeMap<String, String>,
    ) -> Result<RenderedJob> {
        let content = serde_json::to_string_pretty(params)
            .map_err(|e| Error::Render {
                job: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(RenderedJob {
            name: name.to_string(),
            template: job.template.clone(),
            content,
            params: params.clone(),
        })
    }
}
