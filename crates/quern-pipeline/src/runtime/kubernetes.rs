//! Container cluster runtime.
//!
//! Translates a rendered job into a pod manifest, submits it to the
//! cluster API, and polls the pod phase until completion. On success the
//! captured pod log becomes the job log artifact; a failed pod maps to
//! `fail` unless the pod never started, which maps to `incomplete`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use quern_core::config::{RuntimeConfig, RuntimeKind};
use quern_core::Node;

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::runtime::{JobHandle, JobStatus, RenderedJob, Runtime};

const DEFAULT_NAMESPACE: &str = "default";

/// Runtime submitting jobs as pods to a cluster API.
pub struct KubernetesRuntime {
    name: String,
    base_url: String,
    namespace: String,
    token: Option<String>,
    client: reqwest::Client,
    blobs: Arc<dyn BlobStore>,
}

impl KubernetesRuntime {
    /// Creates a cluster runtime from its configuration.
    ///
    /// # Errors
    ///
    /// Returns a submission error if the runtime has no URL configured or
    /// the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        config: &RuntimeConfig,
        token: Option<String>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| Error::submission(&name, "kubernetes runtime requires a url"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::submission(&name, format!("building http client: {e}")))?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: config
                .context
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            token,
            client,
            blobs,
        })
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.base_url, self.namespace
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn manifest(&self, job: &RenderedJob, node: &Node, pod_name: &str) -> serde_json::Value {
        let image = job
            .params
            .get("image")
            .map_or("busybox", String::as_str);
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "labels": {
                    "quern/node": node.id.to_string(),
                    "quern/job": job.name,
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "job",
                    "image": image,
                    "command": ["sh", "-c", job.content],
                }],
            },
        })
    }

    async fn pod_phase(&self, pod_name: &str) -> Result<String> {
        let response = self
            .request(
                reqwest::Method::GET,
                format!("{}/{pod_name}", self.pods_url()),
            )
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("polling pod: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::submission(
                &self.name,
                format!("pod status returned {status}"),
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::submission(&self.name, format!("decoding pod: {e}")))?;
        Ok(body["status"]["phase"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string())
    }
}

#[async_trait]
impl Runtime for KubernetesRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Kubernetes
    }

    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle> {
        let pod_name = format!("quern-{}", node.id.to_string().to_lowercase());
        let manifest = self.manifest(job, node, &pod_name);

        tracing::info!(node = %node.id, job = %job.name, pod = %pod_name, "submitting pod");
        let response = self
            .request(reqwest::Method::POST, self.pods_url())
            .json(&manifest)
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("creating pod: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::submission(
                &self.name,
                format!("pod create returned {status}"),
            ));
        }

        Ok(JobHandle {
            runtime: self.name.clone(),
            job_id: pod_name,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let phase = self.pod_phase(&handle.job_id).await?;
        Ok(match phase.as_str() {
            "Pending" => JobStatus::Queued,
            "Running" => JobStatus::Running,
            "Succeeded" => JobStatus::Succeeded,
            _ => JobStatus::Failed,
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/{}", self.pods_url(), handle.job_id),
            )
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("deleting pod: {e}")))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::submission(
                &self.name,
                format!("pod delete returned {status}"),
            ));
        }
        Ok(())
    }

    async fn collect(&self, handle: &JobHandle) -> Result<serde_json::Value> {
        let phase = self.pod_phase(&handle.job_id).await?;

        let log_response = self
            .request(
                reqwest::Method::GET,
                format!("{}/{}/log", self.pods_url(), handle.job_id),
            )
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("fetching pod log: {e}")))?;

        let log_url = if log_response.status().is_success() {
            let log = log_response
                .bytes()
                .await
                .map_err(|e| Error::submission(&self.name, format!("reading pod log: {e}")))?;
            let log_name = format!("{}-{}.log", self.name, handle.job_id);
            match self.blobs.upload(&log_name, Bytes::from(log.to_vec())).await {
                Ok(url) => Some(url),
                Err(err) => {
                    tracing::warn!(pod = %handle.job_id, error = %err, "log upload failed");
                    None
                }
            }
        } else {
            None
        };

        // A pod that failed before its container ever ran gives no signal
        // about the kernel; report it incomplete rather than failed.
        let result = match phase.as_str() {
            "Succeeded" => "pass",
            "Pending" | "Unknown" => "incomplete",
            _ => "fail",
        };

        let mut payload = serde_json::json!({
            "job_id": handle.job_id,
            "result": result,
        });
        if let Some(url) = log_url {
            payload["artifacts"] = serde_json::json!({ "log": url });
        }
        Ok(payload)
    }
}
