//! LAVA lab runtime.
//!
//! Jobs are submitted as YAML definitions carrying a notify/callback
//! stanza pointing back at the pipeline's callback endpoint; the token
//! *description* named there is public, while the secret value it maps
//! to is configured per runtime and checked by the callback ingestor.
//!
//! The lab is never polled. Completion arrives asynchronously as a
//! callback payload, which [`parse_callback`] translates into the common
//! results shape. The `lava` suite reports the lab's own setup steps and
//! is mapped onto the `setup` suite name so a broken environment rolls
//! up as `incomplete` rather than `fail`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use quern_core::config::{RuntimeConfig, RuntimeKind};
use quern_core::{Node, NodeResult};

use crate::error::{Error, Result};
use crate::results::{ResultsPayload, TestResult};
use crate::runtime::{JobHandle, JobStatus, RenderedJob, Runtime};

const SETUP_SUITE: &str = "lava";

/// Runtime submitting jobs to a LAVA lab.
pub struct LavaRuntime {
    name: String,
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    job_ids: Vec<u64>,
    #[serde(default)]
    id: Option<u64>,
}

impl LavaRuntime {
    /// Creates a LAVA runtime from its configuration.
    ///
    /// # Errors
    ///
    /// Returns a submission error if the runtime has no URL configured or
    /// the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        config: &RuntimeConfig,
        token: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| Error::submission(&name, "lava runtime requires a url"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::submission(&name, format!("building http client: {e}")))?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[async_trait]
impl Runtime for LavaRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Lava
    }

    async fn submit(&self, job: &RenderedJob, node: &Node) -> Result<JobHandle> {
        tracing::info!(node = %node.id, job = %job.name, "submitting lava job");
        let mut builder = self
            .client
            .post(format!("{}/api/v0.2/jobs/", self.base_url))
            .json(&serde_json::json!({ "definition": job.content }));
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Token {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("submitting job: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::submission(
                &self.name,
                format!("job submission returned {status}"),
            ));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::submission(&self.name, format!("decoding submission: {e}")))?;
        let job_id = body
            .job_ids
            .first()
            .copied()
            .or(body.id)
            .ok_or_else(|| Error::submission(&self.name, "submission returned no job id"))?;

        Ok(JobHandle {
            runtime: self.name.clone(),
            job_id: job_id.to_string(),
        })
    }

    async fn poll(&self, _handle: &JobHandle) -> Result<JobStatus> {
        Ok(JobStatus::External)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut builder = self.client.post(format!(
            "{}/api/v0.2/jobs/{}/cancel/",
            self.base_url, handle.job_id
        ));
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Token {token}"));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::submission(&self.name, format!("cancelling job: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::submission(
                &self.name,
                format!("cancel returned {status}"),
            ));
        }
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

    fn ingest_result(&self, _node: &Node, payload: &serde_json::Value) -> Result<ResultsPayload> {
        parse_callback(payload)
    }
}

fn parse_result(raw: &str) -> NodeResult {
    match raw {
        "pass" => NodeResult::Pass,
        "skip" => NodeResult::Skip,
        "fail" => NodeResult::Fail,
        _ => NodeResult::Incomplete,
    }
}

/// Translates a LAVA callback payload into the common results shape.
///
/// # Errors
///
/// Returns a payload rejection when required fields are missing; the
/// caller maps this to a 4xx with no node side effects.
pub fn parse_callback(payload: &serde_json::Value) -> Result<ResultsPayload> {
    let object = payload
        .as_object()
        .ok_or_else(|| Error::rejected("callback payload must be an object"))?;

    let job_id = object
        .get("id")
        .and_then(|v| {
            v.as_u64()
                .map(|id| id.to_string())
                .or_else(|| v.as_str().map(str::to_string))
        })
        .ok_or_else(|| Error::rejected("callback payload carries no job id"))?;

    let status = object
        .get("status_string")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::rejected("callback payload carries no status"))?;

    let mut tests = Vec::new();
    if let Some(results) = object.get("results").and_then(serde_json::Value::as_object) {
        for (suite, cases) in results {
            let suite_name = if suite == SETUP_SUITE {
                crate::aggregate::SETUP_NAME.to_string()
            } else {
                suite.clone()
            };

            let mut children = Vec::new();
            if let Some(cases) = cases.as_array() {
                for case in cases {
                    let Some(name) = case.get("name").and_then(serde_json::Value::as_str) else {
                        continue;
                    };
                    let result = case
                        .get("result")
                        .and_then(serde_json::Value::as_str)
                        .map_or(NodeResult::Incomplete, parse_result);
                    children.push(TestResult {
                        name: name.to_string(),
                        result,
                        artifacts: BTreeMap::new(),
                        children: Vec::new(),
                    });
                }
            }

            let suite_result = if children.iter().any(|c| c.result == NodeResult::Fail) {
                NodeResult::Fail
            } else if !children.is_empty()
                && children.iter().all(|c| c.result == NodeResult::Skip)
            {
                NodeResult::Skip
            } else {
                NodeResult::Pass
            };

            tests.push(TestResult {
                name: suite_name,
                result: suite_result,
                artifacts: BTreeMap::new(),
                children,
            });
        }
    }

    let setup_failed = tests
        .iter()
        .any(|t| t.name == crate::aggregate::SETUP_NAME && t.result == NodeResult::Fail);
    let any_failed = tests.iter().any(|t| t.result == NodeResult::Fail);

    let result = if status != "complete" || setup_failed {
        NodeResult::Incomplete
    } else if any_failed {
        NodeResult::Fail
    } else {
        NodeResult::Pass
    };

    let mut artifacts = BTreeMap::new();
    if let Some(log) = object.get("log").and_then(serde_json::Value::as_str) {
        artifacts.insert("log".to_string(), log.to_string());
    }

    Ok(ResultsPayload {
        job_id: Some(job_id),
        result,
        artifacts,
        tests,
        error_code: (status != "complete").then(|| status.to_string()),
        error_msg: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback(status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": 4242,
            "status_string": status,
            "results": {
                "lava": [
                    {"name": "validate", "result": "pass"},
                    {"name": "deploy", "result": "pass"},
                ],
                "baseline": [
                    {"name": "dmesg-crit", "result": "pass"},
                    {"name": "login", "result": "pass"},
                ],
            },
            "log": "https://lab.example.org/logs/4242",
        })
    }

    #[test]
    fn complete_all_pass() {
        let payload = parse_callback(&callback("complete")).unwrap();
        assert_eq!(payload.job_id.as_deref(), Some("4242"));
        assert_eq!(payload.result, NodeResult::Pass);
        assert_eq!(payload.tests.len(), 2);
        assert!(payload.artifacts.contains_key("log"));
    }

    #[test]
    fn lava_suite_becomes_setup() {
        let payload = parse_callback(&callback("complete")).unwrap();
        assert!(payload
            .tests
            .iter()
            .any(|t| t.name == crate::aggregate::SETUP_NAME));
        assert!(!payload.tests.iter().any(|t| t.name == "lava"));
    }

    #[test]
    fn failed_case_fails_the_job() {
        let mut body = callback("complete");
        body["results"]["baseline"][1]["result"] = serde_json::json!("fail");
        let payload = parse_callback(&body).unwrap();
        assert_eq!(payload.result, NodeResult::Fail);
    }

    #[test]
    fn setup_failure_is_incomplete() {
        let mut body = callback("complete");
        body["results"]["lava"][0]["result"] = serde_json::json!("fail");
        let payload = parse_callback(&body).unwrap();
        assert_eq!(payload.result, NodeResult::Incomplete);
    }

    #[test]
    fn incomplete_status_is_incomplete() {
        let payload = parse_callback(&callback("incomplete")).unwrap();
        assert_eq!(payload.result, NodeResult::Incomplete);
        assert_eq!(payload.error_code.as_deref(), Some("incomplete"));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = parse_callback(&serde_json::json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::PayloadRejected { .. }));

        let err = parse_callback(&serde_json::json!({"status_string": "complete"})).unwrap_err();
        assert!(matches!(err, Error::PayloadRejected { .. }));
    }
}
