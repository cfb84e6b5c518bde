//! HTTP backend implementations
//!
//! Two shapes cover the production backends:
//!
//! - [`WorkflowHttpBackend`]: a GPU workflow host with submit/status/result
//!   job routes (webhook- and poll-mode tools, plus synchronous runs)
//! - [`LlmHttpBackend`]: request/response LLM-style services (immediate
//!   tools only)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conjure_types::{BackendId, BackendJobId, NormalizedInputs, OutputPayload};

use crate::{retry, BackendError, BackendResponse, JobStatus, Result, RetryPolicy, ToolBackend};

async fn read_error_body(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    BackendError::Http {
        status,
        message: message.chars().take(512).collect(),
    }
}

fn map_reqwest_error(err: reqwest::Error, started: Instant) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else if err.is_connect() {
        BackendError::Connect {
            message: err.to_string(),
        }
    } else {
        BackendError::InvalidResponse {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Workflow host (GPU jobs)
// ============================================================================

#[derive(Serialize)]
struct SubmitRequest<'a> {
    workflow: &'a str,
    inputs: &'a NormalizedInputs,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<&'a str>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResultResponse {
    outputs: OutputPayload,
    #[serde(default)]
    runtime_ms: Option<u64>,
}

/// A remote GPU workflow service speaking the job protocol:
/// `POST {base}/run`, `POST {base}/run_sync`, `GET {base}/jobs/{id}/status`,
/// `GET {base}/jobs/{id}/result`, `POST {base}/jobs/{id}/cancel`.
pub struct WorkflowHttpBackend {
    id: BackendId,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry_policy: RetryPolicy,
}

impl WorkflowHttpBackend {
    pub fn new(
        id: BackendId,
        base_url: impl Into<String>,
        api_key: Option<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            retry_policy,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ToolBackend for WorkflowHttpBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn invoke(
        &self,
        endpoint: &str,
        inputs: &NormalizedInputs,
        deadline: Duration,
    ) -> Result<BackendResponse> {
        let started = Instant::now();
        let body = SubmitRequest {
            workflow: endpoint,
            inputs,
            webhook_url: None,
        };
        // Synchronous runs are not retried wholesale: the backend may have
        // done the work even when our read of the response fails.
        let response = self
            .request(reqwest::Method::POST, "/run_sync")
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, started))?;

        if !response.status().is_success() {
            return Err(read_error_body(response).await);
        }

        let parsed: ResultResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                message: e.to_string(),
            })?;
        Ok(BackendResponse {
            outputs: parsed.outputs,
            runtime_ms: parsed
                .runtime_ms
                .or(Some(started.elapsed().as_millis() as u64)),
        })
    }

    async fn submit(
        &self,
        endpoint: &str,
        inputs: &NormalizedInputs,
        callback_url: Option<&str>,
    ) -> Result<BackendJobId> {
        let response = retry(&self.retry_policy, || async {
            let started = Instant::now();
            let body = SubmitRequest {
                workflow: endpoint,
                inputs,
                webhook_url: callback_url,
            };
            let response = self
                .request(reqwest::Method::POST, "/run")
                .json(&body)
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, started))?;
            if !response.status().is_success() {
                return Err(read_error_body(response).await);
            }
            response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    message: e.to_string(),
                })
        })
        .await?;
        Ok(BackendJobId::new(response.job_id))
    }

    async fn status(&self, job_id: &BackendJobId) -> Result<JobStatus> {
        let started = Instant::now();
        let response = self
            .request(reqwest::Method::GET, &format!("/jobs/{}/status", job_id))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, started))?;

        if response.status().as_u16() == 404 {
            return Err(BackendError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(read_error_body(response).await);
        }

        let parsed: StatusResponse =
            response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    message: e.to_string(),
                })?;
        Ok(match parsed.status.as_str() {
            "queued" | "running" => JobStatus::Running,
            "succeeded" | "completed" => JobStatus::Succeeded,
            "failed" | "error" => JobStatus::Failed {
                message: parsed.error.unwrap_or_else(|| "job failed".to_string()),
            },
            other => {
                return Err(BackendError::InvalidResponse {
                    message: format!("unknown job status '{}'", other),
                })
            }
        })
    }

    async fn fetch_result(&self, job_id: &BackendJobId) -> Result<BackendResponse> {
        let parsed = retry(&self.retry_policy, || async {
            let started = Instant::now();
            let response = self
                .request(reqwest::Method::GET, &format!("/jobs/{}/result", job_id))
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, started))?;
            if response.status().as_u16() == 404 {
                return Err(BackendError::JobNotFound {
                    job_id: job_id.to_string(),
                });
            }
            if !response.status().is_success() {
                return Err(read_error_body(response).await);
            }
            response
                .json::<ResultResponse>()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    message: e.to_string(),
                })
        })
        .await?;
        Ok(BackendResponse {
            outputs: parsed.outputs,
            runtime_ms: parsed.runtime_ms,
        })
    }

    async fn cancel(&self, job_id: &BackendJobId) -> Result<()> {
        let started = Instant::now();
        let response = self
            .request(reqwest::Method::POST, &format!("/jobs/{}/cancel", job_id))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, started))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(read_error_body(response).await);
        }
        Ok(())
    }
}

// ============================================================================
// LLM-style request/response services
// ============================================================================

#[derive(Serialize)]
struct CompletionRequest<'a> {
    #[serde(flatten)]
    inputs: &'a NormalizedInputs,
}

/// Request/response services without a job lifecycle. Immediate tools only;
/// the job methods are contract violations if ever reached.
pub struct LlmHttpBackend {
    id: BackendId,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmHttpBackend {
    pub fn new(id: BackendId, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            id,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ToolBackend for LlmHttpBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn invoke(
        &self,
        endpoint: &str,
        inputs: &NormalizedInputs,
        deadline: Duration,
    ) -> Result<BackendResponse> {
        let started = Instant::now();
        let mut builder = self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .timeout(deadline)
            .json(&CompletionRequest { inputs });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, started))?;
        if !response.status().is_success() {
            return Err(read_error_body(response).await);
        }

        let outputs: OutputPayload =
            response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    message: e.to_string(),
                })?;
        Ok(BackendResponse {
            outputs,
            runtime_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    async fn submit(
        &self,
        _endpoint: &str,
        _inputs: &NormalizedInputs,
        _callback_url: Option<&str>,
    ) -> Result<BackendJobId> {
        Err(BackendError::InvalidResponse {
            message: format!("backend '{}' has no job protocol", self.id),
        })
    }

    async fn status(&self, job_id: &BackendJobId) -> Result<JobStatus> {
        Err(BackendError::JobNotFound {
            job_id: job_id.to_string(),
        })
    }

    async fn fetch_result(&self, job_id: &BackendJobId) -> Result<BackendResponse> {
        Err(BackendError::JobNotFound {
            job_id: job_id.to_string(),
        })
    }

    async fn cancel(&self, _job_id: &BackendJobId) -> Result<()> {
        Ok(())
    }
}
