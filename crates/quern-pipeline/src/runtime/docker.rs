//! Docker runtime.
//!
//! Identical contract to the shell runtime, but the command runs inside
//! a named container image.

use std::sync::Arc;

use async_trait::async_trait;

use quern_core::config::RuntimeKind;
use quern_core::Node;

use crate::blob::BlobStore;
use crate::error::Result;
use crate::runtime::shell::LocalExec;
use crate::runtime::{JobHandle, JobStatus, RenderedJob, Runtime};

/// Runtime that runs each job in a docker container.
pub struct DockerRuntime {
    exec: LocalExec,
    image: String,
}

impl DockerRuntime {
    /// Creates a docker runtime using `image` as the default job image.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            exec: LocalExec::new(name, blobs),
            image: image.into(),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn name(&self) -> &str {
        self.exec.name()
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle> {
        // A job-level image overrides the runtime default.
        let image = job
            .params
            .get("image")
            .map_or(self.image.as_str(), String::as_str);

        tracing::info!(node = %node.id, job = %job.name, image, "submitting docker job");
        let mut command = tokio::process::Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .arg(image)
            .arg("sh")
            .arg("-c")
            .arg(&job.content);
        self.exec.spawn(command).await
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.exec.poll(handle).await
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.exec.cancel(handle).await
    }

    async fn collect(&self, handle: &JobHandle) -> Result<serde_json::Value> {
        self.exec.collect(handle).await
    }
}
