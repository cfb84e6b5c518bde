//! Conjure Engine - Executes one generation end-to-end
//!
//! The engine owns the generation state machine
//! (`queued → running → completed | failed | cancelled`) and the settlement
//! that goes with it. The rules that keep the system honest:
//!
//! - Every terminal transition flows through [`ExecutionEngine::settle_and_notify`],
//!   the one place that transitions the record, settles the ledger, and
//!   emits the terminal event. Racing writers (webhook vs poller, cancel vs
//!   completion) are serialized by the store's version check: the loser
//!   reloads, finds the record terminal, and does nothing.
//! - Settlement is keyed by generation id. Completed generations commit at
//!   the actual charge (never above the reserve); failed and cancelled ones
//!   release. Records without a reservation (one-shot payments) skip the
//!   ledger entirely.
//! - Spell-step generations are not special-cased anywhere: their terminal
//!   event is the continuation signal, emitted exactly once like any other.
//!
//! The engine emits events and never calls the spell runner or dispatcher.

pub mod janitor;
pub mod poller;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use conjure_backends::{BackendError, BackendRegistry, BackendResponse};
use conjure_ledger::{CreditLedger, FundsCheck};
use conjure_pricing::RateBook;
use conjure_registry::ToolRegistry;
use conjure_store::{GenerationStore, StoreError};
use conjure_types::{
    BackendJobId, CastId, ConjureError, CostModel, CreditAmount, DeliveryMode, DeliveryStrategy,
    GenerationFailure, GenerationId, GenerationRecord, GenerationStatus, NormalizedInputs,
    OrchestrationEvent, OutputPayload, Platform, ToolDefinition, ToolId, UserId,
};

pub use janitor::{Janitor, JanitorConfig};
pub use poller::{Poller, PollerConfig};

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL backends call back on for webhook-mode jobs
    pub callback_base_url: String,
    /// Retry-after hint handed out under admission control
    pub retry_after_ms: u64,
    /// Smoothing factor for runtime-average feedback (0..1, weight of the
    /// newest sample)
    pub runtime_ewma_alpha: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8080/callbacks/backend".to_string(),
            retry_after_ms: 2_000,
            runtime_ewma_alpha: 0.2,
        }
    }
}

/// Dispatcher queue depth, shared with the engine for admission control.
///
/// The dispatcher updates the depth; the engine refuses new `queued`
/// transitions while the depth is past the high-water mark.
pub struct QueuePressure {
    depth: AtomicUsize,
    high_water: usize,
}

impl QueuePressure {
    pub fn new(high_water: usize) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            high_water,
        }
    }

    pub fn incr(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn over_high_water(&self) -> bool {
        self.depth() > self.high_water
    }
}

/// How a generation's cost is authorized
#[derive(Debug, Clone)]
pub enum CostAuthorization {
    /// Reserve on the credit ledger, keyed by the generation id
    Ledger,
    /// Already paid through the one-shot payment gate; the ledger is bypassed
    OneShot,
}

/// Everything the engine needs to run one generation
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Pre-assigned id, for callers that must register the id before the
    /// generation can reach terminal state (x402 response slots)
    pub generation_id: Option<GenerationId>,
    pub user: UserId,
    pub tool_id: ToolId,
    pub inputs: NormalizedInputs,
    pub delivery_strategy: DeliveryStrategy,
    pub platform: Platform,
    pub delivery_address: Option<String>,
    pub webhook: Option<conjure_types::WebhookTarget>,
    pub parent_cast_id: Option<CastId>,
    pub step_index: Option<usize>,
    pub quoted: CreditAmount,
    pub authorization: CostAuthorization,
}

impl ExecutionRequest {
    pub fn direct(
        user: UserId,
        tool_id: ToolId,
        inputs: NormalizedInputs,
        quoted: CreditAmount,
    ) -> Self {
        Self {
            generation_id: None,
            user,
            tool_id,
            inputs,
            delivery_strategy: DeliveryStrategy::Direct,
            platform: Platform::Api,
            delivery_address: None,
            webhook: None,
            parent_cast_id: None,
            step_index: None,
            quoted,
            authorization: CostAuthorization::Ledger,
        }
    }
}

/// Result handed back to the caller of `execute`
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub generation_id: GenerationId,
    pub status: GenerationStatus,
    /// Populated for immediate tools that completed synchronously
    pub outputs: Option<OutputPayload>,
    pub error: Option<GenerationFailure>,
}

/// The terminal disposition settle_and_notify applies
enum TerminalOutcome {
    Completed {
        outputs: OutputPayload,
        charged: CreditAmount,
    },
    Failed(GenerationFailure),
    Cancelled,
}

/// The execution engine
pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
    backends: Arc<BackendRegistry>,
    store: Arc<dyn GenerationStore>,
    ledger: CreditLedger,
    rates: Arc<RwLock<RateBook>>,
    events: broadcast::Sender<OrchestrationEvent>,
    pressure: Arc<QueuePressure>,
    config: EngineConfig,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        backends: Arc<BackendRegistry>,
        store: Arc<dyn GenerationStore>,
        ledger: CreditLedger,
        rates: Arc<RwLock<RateBook>>,
        events: broadcast::Sender<OrchestrationEvent>,
        pressure: Arc<QueuePressure>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            backends,
            store,
            ledger,
            rates,
            events,
            pressure,
            config,
        }
    }

    pub fn events(&self) -> broadcast::Sender<OrchestrationEvent> {
        self.events.clone()
    }

    pub fn store(&self) -> Arc<dyn GenerationStore> {
        self.store.clone()
    }

    pub fn ledger(&self) -> CreditLedger {
        self.ledger.clone()
    }

    /// Execute one generation.
    ///
    /// Creates the record, authorizes the cost, and dispatches by the
    /// tool's delivery mode. Immediate tools complete (or fail) before this
    /// returns; webhook and poll tools return `Running`.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ConjureError> {
        if self.pressure.over_high_water() {
            return Err(ConjureError::RateLimited {
                retry_after_ms: self.config.retry_after_ms,
            });
        }

        let tool = self
            .registry
            .get(&request.tool_id)
            .map_err(|_| ConjureError::not_found("tool", &request.tool_id))?;

        let mut record = GenerationRecord::queued(
            request.user.clone(),
            request.tool_id.clone(),
            request.inputs.clone(),
            request.delivery_strategy,
            request.quoted,
            request.platform,
        );
        if let Some(id) = request.generation_id.clone() {
            record.id = id;
        }
        record.delivery_address = request.delivery_address.clone();
        record.webhook = request.webhook.clone();
        record.parent_cast_id = request.parent_cast_id.clone();
        record.step_index = request.step_index;
        let generation_id = record.id.clone();

        match self.store.create(record).await {
            Ok(()) => {}
            // A replay with a pre-assigned id yields the one existing record
            Err(StoreError::AlreadyExists { .. }) if request.generation_id.is_some() => {
                let existing = self.get(&generation_id).await?;
                return Ok(ExecutionOutcome {
                    generation_id,
                    status: existing.status,
                    outputs: existing.outputs,
                    error: existing.error,
                });
            }
            Err(e) => return Err(ConjureError::internal(e.to_string())),
        }

        // Authorize the cost before any backend work
        if let CostAuthorization::Ledger = request.authorization {
            let check = self
                .ledger
                .reserve(&request.user, request.quoted, &generation_id)
                .await
                .map_err(|e| ConjureError::internal(e.to_string()))?;
            if let FundsCheck::Insufficient { available } = check {
                let failure = GenerationFailure::from(&ConjureError::InsufficientCredits {
                    required: request.quoted.0,
                    available: available.0,
                });
                self.settle_and_notify(&generation_id, TerminalOutcome::Failed(failure.clone()))
                    .await?;
                return Ok(ExecutionOutcome {
                    generation_id,
                    status: GenerationStatus::Failed,
                    outputs: None,
                    error: Some(failure),
                });
            }
        }

        match tool.delivery_mode {
            DeliveryMode::Immediate => self.run_immediate(&generation_id, &tool).await,
            DeliveryMode::Webhook => self.submit_async(&generation_id, &tool, true).await,
            DeliveryMode::Poll => self.submit_async(&generation_id, &tool, false).await,
        }
    }

    async fn run_immediate(
        &self,
        generation_id: &GenerationId,
        tool: &ToolDefinition,
    ) -> Result<ExecutionOutcome, ConjureError> {
        self.transition_running(generation_id, None).await?;

        let record = self.get(generation_id).await?;
        let deadline = Duration::from_millis(tool.timeouts.soft_ms);
        let invocation = async {
            let lease = self.backends.acquire(&tool.backend.backend).await?;
            lease
                .backend
                .invoke(&tool.backend.endpoint, &record.inputs, deadline)
                .await
        };
        let invocation: Result<BackendResponse, BackendError> = invocation.await;

        match invocation {
            Ok(response) => self.complete_from_response(generation_id, tool, response).await,
            Err(err) => {
                let failure = GenerationFailure::from(&err.classify(tool.id.as_str()));
                self.settle_and_notify(generation_id, TerminalOutcome::Failed(failure.clone()))
                    .await?;
                Ok(ExecutionOutcome {
                    generation_id: generation_id.clone(),
                    status: GenerationStatus::Failed,
                    outputs: None,
                    error: Some(failure),
                })
            }
        }
    }

    async fn submit_async(
        &self,
        generation_id: &GenerationId,
        tool: &ToolDefinition,
        with_callback: bool,
    ) -> Result<ExecutionOutcome, ConjureError> {
        let record = self.get(generation_id).await?;
        let callback = with_callback.then(|| self.config.callback_base_url.clone());

        let submission: Result<BackendJobId, BackendError> = async {
            let lease = self.backends.acquire(&tool.backend.backend).await?;
            lease
                .backend
                .submit(&tool.backend.endpoint, &record.inputs, callback.as_deref())
                .await
        }
        .await;

        match submission {
            Ok(job_id) => {
                self.transition_running(generation_id, Some(job_id)).await?;
                Ok(ExecutionOutcome {
                    generation_id: generation_id.clone(),
                    status: GenerationStatus::Running,
                    outputs: None,
                    error: None,
                })
            }
            Err(err) => {
                let failure = GenerationFailure::from(&err.classify(tool.id.as_str()));
                self.settle_and_notify(generation_id, TerminalOutcome::Failed(failure.clone()))
                    .await?;
                Ok(ExecutionOutcome {
                    generation_id: generation_id.clone(),
                    status: GenerationStatus::Failed,
                    outputs: None,
                    error: Some(failure),
                })
            }
        }
    }

    /// Inbound webhook entry point, keyed by backend job id. Idempotent: a
    /// duplicate callback after the terminal transition is a no-op.
    pub async fn handle_backend_callback(
        &self,
        job_id: &BackendJobId,
    ) -> Result<GenerationStatus, ConjureError> {
        let record = self
            .store
            .find_by_backend_job(job_id)
            .await
            .map_err(|e| ConjureError::internal(e.to_string()))?
            .ok_or_else(|| ConjureError::not_found("generation for job", job_id))?;

        if record.is_terminal() {
            return Ok(record.status);
        }

        let tool = self
            .registry
            .get(&record.tool_id)
            .map_err(|_| ConjureError::not_found("tool", &record.tool_id))?;
        let backend = self
            .backends
            .get(&tool.backend.backend)
            .ok_or_else(|| ConjureError::internal("backend disappeared"))?;

        // The callback only announces readiness; the result is fetched from
        // the backend, never trusted from the caller.
        match backend.fetch_result(job_id).await {
            Ok(response) => {
                let outcome = self
                    .complete_from_response(&record.id, &tool, response)
                    .await?;
                Ok(outcome.status)
            }
            Err(err) => {
                let failure = GenerationFailure::from(&err.classify(tool.id.as_str()));
                self.settle_and_notify(&record.id, TerminalOutcome::Failed(failure))
                    .await?;
                Ok(GenerationStatus::Failed)
            }
        }
    }

    /// Cancel a queued or running generation. Best-effort upstream; the
    /// record transitions and the reserve is released promptly. A cancel
    /// after terminal status is a no-op.
    pub async fn cancel(&self, generation_id: &GenerationId) -> Result<GenerationStatus, ConjureError> {
        let record = self.get(generation_id).await?;
        if record.is_terminal() {
            return Ok(record.status);
        }

        if let Some(job_id) = &record.backend_job_id {
            if let Ok(tool) = self.registry.get(&record.tool_id) {
                if let Some(backend) = self.backends.get(&tool.backend.backend) {
                    if let Err(err) = backend.cancel(job_id).await {
                        tracing::warn!(job = %job_id, error = %err, "backend cancel failed");
                    }
                }
            }
        }

        self.settle_and_notify(generation_id, TerminalOutcome::Cancelled)
            .await?;
        Ok(GenerationStatus::Cancelled)
    }

    /// Apply a successful backend response: enforce the missing-output
    /// policy, compute the actual charge, and settle.
    async fn complete_from_response(
        &self,
        generation_id: &GenerationId,
        tool: &ToolDefinition,
        response: BackendResponse,
    ) -> Result<ExecutionOutcome, ConjureError> {
        if response.outputs.is_empty() && !tool.allow_empty_output {
            let failure = GenerationFailure::from(&ConjureError::backend(
                "backend reported success with no outputs",
            ));
            self.settle_and_notify(generation_id, TerminalOutcome::Failed(failure.clone()))
                .await?;
            return Ok(ExecutionOutcome {
                generation_id: generation_id.clone(),
                status: GenerationStatus::Failed,
                outputs: None,
                error: Some(failure),
            });
        }

        let record = self.get(generation_id).await?;
        let charged = self.actual_charge(tool, &record, response.runtime_ms);
        if let Some(runtime_ms) = response.runtime_ms {
            self.record_runtime(&tool.id, runtime_ms);
        }

        self.settle_and_notify(
            generation_id,
            TerminalOutcome::Completed {
                outputs: response.outputs.clone(),
                charged,
            },
        )
        .await?;
        Ok(ExecutionOutcome {
            generation_id: generation_id.clone(),
            status: GenerationStatus::Completed,
            outputs: Some(response.outputs),
            error: None,
        })
    }

    /// Final charge for a completed generation. Never above the reserve:
    /// runtime-priced tools are clamped to the quote, everything else
    /// charges the quote itself.
    fn actual_charge(
        &self,
        tool: &ToolDefinition,
        record: &GenerationRecord,
        runtime_ms: Option<u64>,
    ) -> CreditAmount {
        let quoted = record.cost.quoted;
        match (&tool.cost_model, runtime_ms) {
            (CostModel::PerBackendSecond { hardware_class }, Some(runtime_ms)) => {
                let rates = self.rates.read();
                let Some(rate) = rates.gpu_second_rates.get(hardware_class) else {
                    return quoted;
                };
                let seconds = rust_decimal::Decimal::from(runtime_ms) / rust_decimal::Decimal::from(1000u32);
                let usd = conjure_types::UsdAmount::new(*rate * seconds);
                match rates.credit_rate.to_credits(usd) {
                    Ok(actual) => actual.min(quoted),
                    Err(_) => quoted,
                }
            }
            _ => quoted,
        }
    }

    /// Feed the observed runtime back into the rate book average.
    fn record_runtime(&self, tool_id: &ToolId, runtime_ms: u64) {
        let alpha = self.config.runtime_ewma_alpha;
        let sample = runtime_ms as f64 / 1000.0;
        let mut rates = self.rates.write();
        let average = rates
            .runtime_averages
            .entry(tool_id.clone())
            .or_insert(sample);
        *average = *average * (1.0 - alpha) + sample * alpha;
    }

    async fn transition_running(
        &self,
        generation_id: &GenerationId,
        job_id: Option<BackendJobId>,
    ) -> Result<(), ConjureError> {
        loop {
            let mut record = self.get(generation_id).await?;
            if record.is_terminal() {
                // Cancelled while we were submitting; nothing to start.
                return Ok(());
            }
            if record.status == GenerationStatus::Queued {
                record.status = GenerationStatus::Running;
                record.started_at = Some(Utc::now());
            }
            if let Some(job) = &job_id {
                record.backend_job_id = Some(job.clone());
            }
            match self.store.update(record).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(ConjureError::internal(e.to_string())),
            }
        }
    }

    /// The single terminal path: transition, settle, emit. At most one
    /// caller wins the transition; everyone else observes terminal state
    /// and leaves both the ledger and the event bus untouched.
    async fn settle_and_notify(
        &self,
        generation_id: &GenerationId,
        outcome: TerminalOutcome,
    ) -> Result<(), ConjureError> {
        let record = loop {
            let mut record = self.get(generation_id).await?;
            if record.is_terminal() {
                return Ok(());
            }

            let next = match &outcome {
                TerminalOutcome::Completed { .. } => GenerationStatus::Completed,
                TerminalOutcome::Failed(_) => GenerationStatus::Failed,
                TerminalOutcome::Cancelled => GenerationStatus::Cancelled,
            };
            if !record.status.can_transition_to(next) {
                return Err(ConjureError::internal(format!(
                    "illegal transition {} -> {}",
                    record.status, next
                )));
            }

            record.status = next;
            record.completed_at = Some(Utc::now());
            match &outcome {
                TerminalOutcome::Completed { outputs, charged } => {
                    record.outputs = Some(outputs.clone());
                    record.cost.charged = Some(*charged);
                }
                TerminalOutcome::Failed(failure) => {
                    record.error = Some(failure.clone());
                }
                TerminalOutcome::Cancelled => {}
            }
            record.settled = true;

            match self.store.update(record.clone()).await {
                Ok(_) => break record,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(ConjureError::internal(e.to_string())),
            }
        };

        // Settlement. Records without a reservation (one-shot payment, or a
        // reserve that was never admitted) skip the ledger.
        if self.ledger.has_reservation(generation_id).await {
            let result = match &outcome {
                TerminalOutcome::Completed { charged, .. } => {
                    self.ledger.commit_charged(generation_id, *charged).await
                }
                TerminalOutcome::Failed(failure) => {
                    self.ledger
                        .release_with_reason(generation_id, failure.code.clone())
                        .await
                }
                TerminalOutcome::Cancelled => {
                    self.ledger
                        .release_with_reason(generation_id, "cancelled")
                        .await
                }
            };
            if let Err(err) = result {
                // The janitor re-resolves from the stored terminal state.
                tracing::error!(generation = %generation_id, error = %err, "settlement failed");
            }
        }

        let timestamp = Utc::now();
        let event = match &outcome {
            TerminalOutcome::Completed { charged, .. } => OrchestrationEvent::GenerationCompleted {
                generation_id: generation_id.clone(),
                user: record.user.clone(),
                delivery_strategy: record.delivery_strategy,
                parent_cast_id: record.parent_cast_id.clone(),
                step_index: record.step_index,
                charged: *charged,
                timestamp,
            },
            TerminalOutcome::Failed(failure) => OrchestrationEvent::GenerationFailed {
                generation_id: generation_id.clone(),
                user: record.user.clone(),
                delivery_strategy: record.delivery_strategy,
                parent_cast_id: record.parent_cast_id.clone(),
                step_index: record.step_index,
                error: failure.clone(),
                timestamp,
            },
            TerminalOutcome::Cancelled => OrchestrationEvent::GenerationCancelled {
                generation_id: generation_id.clone(),
                user: record.user.clone(),
                delivery_strategy: record.delivery_strategy,
                parent_cast_id: record.parent_cast_id.clone(),
                step_index: record.step_index,
                timestamp,
            },
        };
        tracing::info!(event = %event.summary(), "generation terminal");
        let _ = self.events.send(event);
        Ok(())
    }

    /// Fail a running generation from a poll observation.
    pub(crate) async fn fail_from_poll(
        &self,
        generation_id: &GenerationId,
        error: ConjureError,
    ) -> Result<(), ConjureError> {
        self.settle_and_notify(
            generation_id,
            TerminalOutcome::Failed(GenerationFailure::from(&error)),
        )
        .await
    }

    /// Complete a running generation from a poll observation.
    pub(crate) async fn complete_from_poll(
        &self,
        generation_id: &GenerationId,
        tool: &ToolDefinition,
        response: BackendResponse,
    ) -> Result<(), ConjureError> {
        self.complete_from_response(generation_id, tool, response)
            .await
            .map(|_| ())
    }

    pub(crate) fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub(crate) fn backend_registry(&self) -> &BackendRegistry {
        &self.backends
    }

    pub(crate) async fn get(&self, id: &GenerationId) -> Result<GenerationRecord, ConjureError> {
        self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => ConjureError::not_found("generation", id),
            other => ConjureError::internal(other.to_string()),
        })
    }
}
