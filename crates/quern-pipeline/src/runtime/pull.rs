//! Pull-lab runtime.
//!
//! The lab polls the state store for work instead of receiving
//! submissions. The adapter only materializes the rendered job
//! description onto the node so the lab can fetch it, and leaves the
//! node `running`; the lab posts results to the callback endpoint when
//! it is done.

use std::sync::Arc;

use async_trait::async_trait;

use quern_core::config::RuntimeKind;
use quern_core::Node;

use crate::error::{Error, Result};
use crate::runtime::{JobHandle, JobStatus, RenderedJob, Runtime};
use crate::store::{CasOutcome, NodeStore};

/// Runtime for labs that pull their own work descriptors.
pub struct PullRuntime {
    name: String,
    store: Arc<dyn NodeStore>,
}

impl PullRuntime {
    /// Creates a pull runtime materializing descriptors into `store`.
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn NodeStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

#[async_trait]
impl Runtime for PullRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Pull
    }

    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle> {
        let mut current = self
            .store
            .get(&node.id)
            .await?
            .ok_or_else(|| Error::NodeNotFound {
                id: node.id.clone(),
            })?;

        let job_id = format!("{}-{}", self.name, node.id);
        current.data.extra.insert(
            "job_definition".to_string(),
            serde_json::Value::String(job.content.clone()),
        );
        current.data.job_id = Some(job_id.clone());

        match self.store.update(&current, None).await? {
            CasOutcome::Updated(_) => {
                tracing::info!(node = %node.id, job = %job.name, "materialized pull descriptor");
                Ok(JobHandle {
                    runtime: self.name.clone(),
                    job_id,
                })
            }
            CasOutcome::StateMismatch { actual } => Err(Error::submission(
                &self.name,
                format!("node moved to {actual} before descriptor write"),
            )),
        }
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus> {
        Ok(JobStatus::External)
    }

    async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
        // The lab owns execution; there is nothing to cancel remotely.
        Ok(())
    }

    async fn collect(&self, handle: &JobHandle) -> Result<serde_json::Value> {
        Err(Error::submission(
            &self.name,
            format!(
                "job {} completes via callback, nothing to collect",
                handle.job_id
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn submit_materializes_descriptor() {
        let store = Arc::new(MemoryStore::new());
        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        let runtime = PullRuntime::new("lab-pull", Arc::clone(&store) as Arc<dyn NodeStore>);
        let job = RenderedJob {
            name: "baseline-arm64".to_string(),
            template: "baseline.jinja2".to_string(),
            content: "steps: [boot]".to_string(),
            params: BTreeMap::new(),
        };

        let handle = runtime.submit(&job, &checkout).await.unwrap();
        assert_eq!(runtime.poll(&handle).await.unwrap(), JobStatus::External);

        let stored = store.get(&checkout.id).await.unwrap().unwrap();
        assert_eq!(stored.data.job_id.as_deref(), Some(handle.job_id.as_str()));
        assert_eq!(
            stored.data.extra["job_definition"],
            serde_json::Value::String("steps: [boot]".to_string())
        );
    }
}
