//! Conjure Backends - Upstream AI service bindings
//!
//! Every tool executes against an opaque upstream service: a GPU workflow
//! host, an LLM API, a media transform. This crate owns that boundary:
//!
//! - [`ToolBackend`]: the trait the execution engine drives
//! - [`BackendError`]: upstream failures, classified into the client-facing
//!   taxonomy exactly once, here
//! - [`retry`]: the single bounded-retry helper every outbound call uses
//! - [`BackendRegistry`]: per-backend concurrency ceilings
//!
//! The engine never sees reqwest types or raw status codes.

pub mod fake;
pub mod http;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use conjure_types::{BackendId, BackendJobId, ConjureError, NormalizedInputs, OutputPayload};

pub use fake::{FakeBackend, FakeScript};
pub use http::{LlmHttpBackend, WorkflowHttpBackend};
pub use retry::{retry, RetryPolicy};

/// Upstream failure, classified at this boundary
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Backend request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Could not reach backend: {message}")]
    Connect { message: String },

    #[error("Backend response was not understood: {message}")]
    InvalidResponse { message: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },
}

impl BackendError {
    /// Transient failures are retried locally; the rest surface immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connect { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse { .. } | Self::JobNotFound { .. } => false,
        }
    }

    /// Map into the client-facing taxonomy.
    pub fn classify(&self, tool_id: &str) -> ConjureError {
        match self {
            Self::Timeout { elapsed_ms } => ConjureError::BackendTimeout {
                tool_id: tool_id.to_string(),
                elapsed_ms: *elapsed_ms,
            },
            other => ConjureError::backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Successful backend response
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub outputs: OutputPayload,
    /// Wall-clock runtime reported by the backend, when available
    pub runtime_ms: Option<u64>,
}

/// Status of an asynchronous backend job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed { message: String },
}

/// One upstream service capable of executing tool endpoints.
///
/// `invoke` serves immediate tools; `submit`/`status`/`fetch_result` serve
/// webhook- and poll-mode tools. `cancel` is best-effort.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn id(&self) -> &BackendId;

    /// Synchronous execution within `deadline`.
    async fn invoke(
        &self,
        endpoint: &str,
        inputs: &NormalizedInputs,
        deadline: Duration,
    ) -> Result<BackendResponse>;

    /// Submit an asynchronous job. `callback_url` is passed for
    /// webhook-mode tools so the backend can call us back.
    async fn submit(
        &self,
        endpoint: &str,
        inputs: &NormalizedInputs,
        callback_url: Option<&str>,
    ) -> Result<BackendJobId>;

    async fn status(&self, job_id: &BackendJobId) -> Result<JobStatus>;

    /// Fetch the full result of a succeeded job.
    async fn fetch_result(&self, job_id: &BackendJobId) -> Result<BackendResponse>;

    /// Forward a cancel upstream. Failures are logged, never surfaced.
    async fn cancel(&self, job_id: &BackendJobId) -> Result<()>;
}

/// A checked-out backend: the handle plus its concurrency permit.
///
/// Holding the permit for the duration of the call enforces the per-backend
/// ceiling; dropping it releases the slot.
pub struct BackendLease {
    pub backend: Arc<dyn ToolBackend>,
    _permit: OwnedSemaphorePermit,
}

/// Registry of configured backends with per-backend concurrency ceilings
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn ToolBackend>>,
    limits: HashMap<BackendId, Arc<Semaphore>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            limits: HashMap::new(),
        }
    }

    /// Register a backend with its concurrency ceiling.
    pub fn register(&mut self, backend: Arc<dyn ToolBackend>, max_concurrency: usize) {
        let id = backend.id().clone();
        self.limits
            .insert(id.clone(), Arc::new(Semaphore::new(max_concurrency.max(1))));
        self.backends.insert(id, backend);
    }

    /// Check out a backend, waiting for a concurrency slot.
    pub async fn acquire(&self, id: &BackendId) -> Result<BackendLease> {
        let backend = self
            .backends
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::Connect {
                message: format!("no backend configured for '{}'", id),
            })?;
        let semaphore = self.limits.get(id).cloned().expect("limit set with backend");
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Connect {
                message: "backend registry shut down".to_string(),
            })?;
        Ok(BackendLease {
            backend,
            _permit: permit,
        })
    }

    /// Look up a backend without taking a slot (status polls, cancels).
    pub fn get(&self, id: &BackendId) -> Option<Arc<dyn ToolBackend>> {
        self.backends.get(id).cloned()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
