//! Local process runtime.
//!
//! Runs the rendered job as a local shell command, streams the combined
//! output to the blob store as the job log, and maps the exit code onto
//! the node result (0 ⇒ pass, anything else ⇒ fail).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use quern_core::config::RuntimeKind;
use quern_core::Node;

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::runtime::{JobHandle, JobStatus, RenderedJob, Runtime};

struct ExecState {
    status: JobStatus,
    exit_code: Option<i32>,
    log_url: Option<String>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Shared bookkeeping for process-spawning runtimes (shell and docker).
pub(crate) struct LocalExec {
    name: String,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<Mutex<HashMap<String, ExecState>>>,
}

impl LocalExec {
    pub(crate) fn new(name: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.into(),
            blobs,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Spawns `command` and tracks it under a fresh job id.
    pub(crate) async fn spawn(&self, mut command: tokio::process::Command) -> Result<JobHandle> {
        let job_id = ulid::Ulid::new().to_string();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command
            .spawn()
            .map_err(|e| Error::submission(&self.name, format!("spawn failed: {e}")))?;

        let jobs = Arc::clone(&self.jobs);
        let blobs = Arc::clone(&self.blobs);
        let runtime_name = self.name.clone();
        let task_job_id = job_id.clone();

        let task = tokio::spawn(async move {
            let output = child.wait_with_output().await;
            let (exit_code, log) = match output {
                Ok(output) => {
                    let mut log = output.stdout;
                    log.extend_from_slice(&output.stderr);
                    (output.status.code().unwrap_or(-1), log)
                }
                Err(err) => (-1, format!("wait failed: {err}").into_bytes()),
            };

            let log_name = format!("{runtime_name}-{task_job_id}.log");
            let log_url = match blobs.upload(&log_name, Bytes::from(log)).await {
                Ok(url) => Some(url),
                Err(err) => {
                    tracing::warn!(job = %task_job_id, error = %err, "log upload failed");
                    None
                }
            };

            let mut jobs = jobs.lock().await;
            if let Some(state) = jobs.get_mut(&task_job_id) {
                state.status = if exit_code == 0 {
                    JobStatus::Succeeded
                } else {
                    JobStatus::Failed
                };
                state.exit_code = Some(exit_code);
                state.log_url = log_url;
            }
        });

        self.jobs.lock().await.insert(
            job_id.clone(),
            ExecState {
                status: JobStatus::Running,
                exit_code: None,
                log_url: None,
                task: Some(task),
            },
        );

        Ok(JobHandle {
            runtime: self.name.clone(),
            job_id,
        })
    }

    pub(crate) async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.jobs
            .lock()
            .await
            .get(&handle.job_id)
            .map(|state| state.status)
            .ok_or_else(|| Error::submission(&self.name, format!("unknown job {}", handle.job_id)))
    }

    pub(crate) async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(state) = jobs.get_mut(&handle.job_id) {
            if let Some(task) = state.task.take() {
                task.abort();
            }
            if !state.status.is_terminal() {
                state.status = JobStatus::Failed;
                state.exit_code = Some(-1);
            }
        }
        Ok(())
    }

    pub(crate) async fn collect(&self, handle: &JobHandle) -> Result<serde_json::Value> {
        let jobs = self.jobs.lock().await;
        let state = jobs
            .get(&handle.job_id)
            .ok_or_else(|| Error::submission(&self.name, format!("unknown job {}", handle.job_id)))?;

        let result = match state.exit_code {
            Some(0) => "pass",
            Some(_) => "fail",
            None => {
                return Err(Error::submission(
                    &self.name,
                    format!("job {} has not finished", handle.job_id),
                ))
            }
        };

        let mut payload = serde_json::json!({
            "job_id": handle.job_id,
            "result": result,
        });
        if let Some(url) = &state.log_url {
            payload["artifacts"] = serde_json::json!({ "log": url });
        }
        Ok(payload)
    }
}

/// Runtime that forks a local shell per job.
pub struct ShellRuntime {
    exec: LocalExec,
}

impl ShellRuntime {
    /// Creates a shell runtime uploading logs to `blobs`.
    #[must_use]
    pub fn new(name: impl Into<String>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            exec: LocalExec::new(name, blobs),
        }
    }
}

#[async_trait]
impl Runtime for ShellRuntime {
    fn name(&self) -> &str {
        self.exec.name()
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Shell
    }

    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle> {
        tracing::info!(node = %node.id, job = %job.name, "submitting shell job");
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(&job.content);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBlobStore;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn rendered(content: &str) -> RenderedJob {
        RenderedJob {
            name: "kunit".to_string(),
            template: "shell.jinja2".to_string(),
            content: content.to_string(),
            params: BTreeMap::new(),
        }
    }

    async fn wait_terminal(runtime: &ShellRuntime, handle: &JobHandle) -> JobStatus {
        for _ in 0..100 {
            let status = runtime.poll(handle).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never finished");
    }

    #[tokio::test]
    async fn exit_zero_maps_to_pass() {
        let runtime = ShellRuntime::new("shell", Arc::new(MemoryBlobStore::new()));
        let node = Node::checkout("mainline", "master", "abc", "url");
        let handle = runtime.submit(&rendered("true"), &node).await.unwrap();

        assert_eq!(wait_terminal(&runtime, &handle).await, JobStatus::Succeeded);
        let payload = runtime.collect(&handle).await.unwrap();
        assert_eq!(payload["result"], "pass");
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_fail() {
        let runtime = ShellRuntime::new("shell", Arc::new(MemoryBlobStore::new()));
        let node = Node::checkout("mainline", "master", "abc", "url");
        let handle = runtime.submit(&rendered("exit 3"), &node).await.unwrap();

        assert_eq!(wait_terminal(&runtime, &handle).await, JobStatus::Failed);
        let payload = runtime.collect(&handle).await.unwrap();
        assert_eq!(payload["result"], "fail");
    }

    #[tokio::test]
    async fn log_is_uploaded() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let runtime = ShellRuntime::new("shell", Arc::clone(&blobs) as Arc<dyn BlobStore>);
        let node = Node::checkout("mainline", "master", "abc", "url");
        let handle = runtime
            .submit(&rendered("echo kernel boot ok"), &node)
            .await
            .unwrap();

        wait_terminal(&runtime, &handle).await;
        let payload = runtime.collect(&handle).await.unwrap();
        let url = payload["artifacts"]["log"].as_str().unwrap();
        assert!(url.starts_with("memory://"));
    }
}
