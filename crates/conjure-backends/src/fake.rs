//! Scripted in-memory backend for tests
//!
//! Each endpoint is scripted with an outcome; job-mode scripts report
//! `Running` for a configured number of status polls before finishing.
//! Cancels and submissions are recorded for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use conjure_types::{BackendId, BackendJobId, NormalizedInputs, OutputPayload};

use crate::{BackendError, BackendResponse, JobStatus, Result, ToolBackend};

/// Scripted behavior for one endpoint
#[derive(Debug, Clone)]
pub enum FakeScript {
    /// Immediate success with these outputs
    Ok(OutputPayload),
    /// Immediate failure
    Err(String),
    /// Immediate timeout
    Timeout,
    /// Async job: `Running` for `polls_until_done` polls, then the outcome
    Job {
        polls_until_done: u32,
        outcome: std::result::Result<OutputPayload, String>,
    },
    /// Async job that never finishes (hard-deadline tests)
    Stuck,
}

struct JobState {
    script: FakeScript,
    polls_seen: u32,
}

/// In-memory [`ToolBackend`] with scripted outcomes
pub struct FakeBackend {
    id: BackendId,
    scripts: Mutex<HashMap<String, FakeScript>>,
    jobs: Mutex<HashMap<BackendJobId, JobState>>,
    job_counter: AtomicU64,
    pub submitted: Mutex<Vec<(String, Option<String>)>>,
    pub cancelled: Mutex<Vec<BackendJobId>>,
}

impl FakeBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: BackendId::new(id),
            scripts: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, endpoint: impl Into<String>, script: FakeScript) {
        self.scripts.lock().unwrap().insert(endpoint.into(), script);
    }

    /// Shorthand: immediate success with a single named output
    pub fn script_ok(&self, endpoint: impl Into<String>, output: (&str, serde_json::Value)) {
        let mut payload = OutputPayload::new();
        payload.insert(output.0, output.1);
        self.script(endpoint, FakeScript::Ok(payload));
    }

    fn script_for(&self, endpoint: &str) -> Result<FakeScript> {
        self.scripts
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| BackendError::Http {
                status: 404,
                message: format!("no script for endpoint '{}'", endpoint),
            })
    }

    pub fn cancel_count(&self) -> usize {
        self.cancelled.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolBackend for FakeBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn invoke(
        &self,
        endpoint: &str,
        _inputs: &NormalizedInputs,
        deadline: Duration,
    ) -> Result<BackendResponse> {
        match self.script_for(endpoint)? {
            FakeScript::Ok(outputs) => Ok(BackendResponse {
                outputs,
                runtime_ms: Some(5),
            }),
            FakeScript::Err(message) => Err(BackendError::Http {
                status: 500,
                message,
            }),
            FakeScript::Timeout => Err(BackendError::Timeout {
                elapsed_ms: deadline.as_millis() as u64,
            }),
            FakeScript::Job { .. } | FakeScript::Stuck => Err(BackendError::InvalidResponse {
                message: "endpoint is scripted as a job".to_string(),
            }),
        }
    }

    async fn submit(
        &self,
        endpoint: &str,
        _inputs: &NormalizedInputs,
        callback_url: Option<&str>,
    ) -> Result<BackendJobId> {
        let script = self.script_for(endpoint)?;
        let job_id = BackendJobId::new(format!(
            "fake-job-{}",
            self.job_counter.fetch_add(1, Ordering::SeqCst)
        ));
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            JobState {
                script,
                polls_seen: 0,
            },
        );
        self.submitted
            .lock()
            .unwrap()
            .push((endpoint.to_string(), callback_url.map(String::from)));
        Ok(job_id)
    }

    async fn status(&self, job_id: &BackendJobId) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(job_id).ok_or_else(|| BackendError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        job.polls_seen += 1;
        match &job.script {
            FakeScript::Stuck => Ok(JobStatus::Running),
            FakeScript::Job {
                polls_until_done,
                outcome,
            } => {
                if job.polls_seen <= *polls_until_done {
                    Ok(JobStatus::Running)
                } else {
                    match outcome {
                        Ok(_) => Ok(JobStatus::Succeeded),
                        Err(message) => Ok(JobStatus::Failed {
                            message: message.clone(),
                        }),
                    }
                }
            }
            _ => Ok(JobStatus::Succeeded),
        }
    }

    async fn fetch_result(&self, job_id: &BackendJobId) -> Result<BackendResponse> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs.get(job_id).ok_or_else(|| BackendError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        match &job.script {
            FakeScript::Job {
                outcome: Ok(outputs),
                ..
            } => Ok(BackendResponse {
                outputs: outputs.clone(),
                runtime_ms: Some(10),
            }),
            FakeScript::Ok(outputs) => Ok(BackendResponse {
                outputs: outputs.clone(),
                runtime_ms: Some(10),
            }),
            _ => Err(BackendError::InvalidResponse {
                message: "job did not succeed".to_string(),
            }),
        }
    }

    async fn cancel(&self, job_id: &BackendJobId) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_immediate_script() {
        let backend = FakeBackend::new("fake");
        backend.script_ok("echo", ("text", json!("hi")));
        let response = backend
            .invoke("echo", &NormalizedInputs::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.outputs.get("text"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let backend = FakeBackend::new("fake");
        let mut outputs = OutputPayload::new();
        outputs.insert("image", json!("https://cdn/img.png"));
        backend.script(
            "flux",
            FakeScript::Job {
                polls_until_done: 2,
                outcome: Ok(outputs),
            },
        );

        let job = backend
            .submit("flux", &NormalizedInputs::new(), None)
            .await
            .unwrap();
        assert_eq!(backend.status(&job).await.unwrap(), JobStatus::Running);
        assert_eq!(backend.status(&job).await.unwrap(), JobStatus::Running);
        assert_eq!(backend.status(&job).await.unwrap(), JobStatus::Succeeded);

        let result = backend.fetch_result(&job).await.unwrap();
        assert!(result.outputs.get("image").is_some());
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let backend = FakeBackend::new("fake");
        assert!(backend
            .invoke("nope", &NormalizedInputs::new(), Duration::from_secs(1))
            .await
            .is_err());
    }
}
