//! Conjure Dispatch - Terminal-event delivery
//!
//! The dispatcher is the single consumer of terminal orchestration events
//! and the only component that calls the spell runner. Routing is keyed by
//! delivery strategy:
//!
//! | strategy              | destination                                |
//! |-----------------------|--------------------------------------------|
//! | direct                | originating platform channel               |
//! | spell_step/spell_final| spell runner `continue_cast`               |
//! | webhook               | signed POST to the stored URL              |
//! | x402                  | the HTTP response slot the gate holds open |
//!
//! Each terminal event is delivered at least once; receivers are
//! idempotent by generation id. A delivery that exhausts its retries marks
//! the generation `delivery_failed` (the generation itself succeeded) and
//! can be reissued manually.

pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

use conjure_engine::QueuePressure;
use conjure_pricing::RateBook;
use conjure_spells::SpellRunner;
use conjure_store::{CastStore, GenerationStore, StoreError};
use conjure_types::{
    CreditAmount, DeliveryStrategy, GenerationFailure, GenerationId, GenerationRecord,
    GenerationStatus, OrchestrationEvent, Platform, SpellCast,
};

pub use webhook::{canonical_payload, sign_payload, verify_signature, WebhookDeliverer,
    SIGNATURE_HEADER};

/// Errors from dispatch operations
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Payload error: {message}")]
    Payload { message: String },

    #[error("Delivery failed: {message}")]
    Delivery { message: String },

    #[error("No channel for platform {platform}")]
    NoChannel { platform: Platform },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Record not found: {id}")]
    NotFound { id: String },
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ============================================================================
// Delivery channels
// ============================================================================

/// A rendered terminal notification for a platform channel
#[derive(Debug, Clone)]
pub struct DeliveryNote {
    pub address: String,
    pub reply_to: Option<String>,
    /// "generation.completed", "spell.failed", ...
    pub event: String,
    pub outputs: Vec<Value>,
    pub error: Option<GenerationFailure>,
    /// Receiver-side duplicate suppression key
    pub idempotency_key: String,
}

/// One outbound platform integration (chat bot, web push)
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn platform(&self) -> Platform;

    async fn deliver(&self, note: &DeliveryNote) -> Result<()>;
}

/// Test channel that records every note it is handed
pub struct RecordingChannel {
    platform: Platform,
    pub notes: parking_lot::Mutex<Vec<DeliveryNote>>,
}

impl RecordingChannel {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            notes: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn deliver(&self, note: &DeliveryNote) -> Result<()> {
        self.notes.lock().push(note.clone());
        Ok(())
    }
}

// ============================================================================
// x402 response slots
// ============================================================================

/// Outcome resolved into a held-open payment response
#[derive(Debug, Clone)]
pub struct SlotOutcome {
    pub generation_id: GenerationId,
    pub status: GenerationStatus,
    pub outputs: Vec<Value>,
    pub error: Option<GenerationFailure>,
}

/// Response slots the payment gate holds open while its generation runs
#[derive(Default)]
pub struct ResponseSlots {
    slots: DashMap<GenerationId, oneshot::Sender<SlotOutcome>>,
}

impl ResponseSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot before executing; the receiver resolves when the
    /// generation reaches terminal state.
    pub fn open(&self, generation_id: GenerationId) -> oneshot::Receiver<SlotOutcome> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(generation_id, tx);
        rx
    }

    fn resolve(&self, outcome: SlotOutcome) {
        if let Some((_, slot)) = self.slots.remove(&outcome.generation_id) {
            let _ = slot.send(outcome);
        }
    }
}

// ============================================================================
// The dispatcher
// ============================================================================

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// Routes terminal events to their delivery channel
pub struct Dispatcher {
    store: Arc<dyn GenerationStore>,
    casts: Arc<dyn CastStore>,
    runner: Arc<SpellRunner>,
    channels: HashMap<Platform, Arc<dyn DeliveryChannel>>,
    webhooks: WebhookDeliverer,
    slots: Arc<ResponseSlots>,
    rates: Arc<RwLock<RateBook>>,
    pressure: Arc<QueuePressure>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn GenerationStore>,
        casts: Arc<dyn CastStore>,
        runner: Arc<SpellRunner>,
        channels: Vec<Arc<dyn DeliveryChannel>>,
        webhooks: WebhookDeliverer,
        slots: Arc<ResponseSlots>,
        rates: Arc<RwLock<RateBook>>,
        pressure: Arc<QueuePressure>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            casts,
            runner,
            channels: channels
                .into_iter()
                .map(|c| (c.platform(), c))
                .collect(),
            webhooks,
            slots,
            rates,
            pressure,
            config,
        }
    }

    pub fn slots(&self) -> Arc<ResponseSlots> {
        self.slots.clone()
    }

    /// Consume the event bus until shutdown: a pump feeds the bounded queue
    /// (whose depth drives engine admission control), a worker pool drains it.
    pub async fn run(
        self: Arc<Self>,
        events: broadcast::Receiver<OrchestrationEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel::<OrchestrationEvent>(self.config.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = Vec::new();
        for worker_id in 0..self.config.workers.max(1) {
            let dispatcher = self.clone();
            let queue_rx = queue_rx.clone();
            let mut shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = async { queue_rx.lock().await.recv().await } => event,
                        _ = shutdown.changed() => return,
                    };
                    let Some(event) = event else { return };
                    dispatcher.pressure.decr();
                    if let Err(err) = dispatcher.handle_event(&event).await {
                        tracing::warn!(worker = worker_id, error = %err, "event delivery failed");
                    }
                }
            }));
        }

        let mut events = events;
        let mut shutdown = shutdown;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => break,
            };
            match event {
                Ok(event) => {
                    self.pressure.incr();
                    if queue_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::error!(missed, "dispatcher lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        drop(queue_tx);
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("dispatcher stopped");
    }

    /// Route one event. Public so tests and the reissue path share it.
    pub async fn handle_event(&self, event: &OrchestrationEvent) -> Result<()> {
        match event {
            OrchestrationEvent::GenerationCompleted { .. }
            | OrchestrationEvent::GenerationFailed { .. }
            | OrchestrationEvent::GenerationCancelled { .. } => {
                let generation_id = event.generation_id().expect("generation event");
                let strategy = event.delivery_strategy().expect("generation event");
                match strategy {
                    DeliveryStrategy::SpellStep | DeliveryStrategy::SpellFinal => {
                        let Some(cast_id) = event.parent_cast_id() else {
                            tracing::error!(generation = %generation_id, "spell event without cast");
                            return Ok(());
                        };
                        self.runner
                            .continue_cast(cast_id, generation_id)
                            .await
                            .map_err(|e| DispatchError::Delivery {
                                message: e.to_string(),
                            })
                    }
                    DeliveryStrategy::Direct => {
                        // Cancellations produce no user-visible message
                        if matches!(event, OrchestrationEvent::GenerationCancelled { .. }) {
                            return Ok(());
                        }
                        let record = self.get_record(generation_id).await?;
                        self.deliver_direct(&record).await
                    }
                    DeliveryStrategy::Webhook => {
                        if matches!(event, OrchestrationEvent::GenerationCancelled { .. }) {
                            return Ok(());
                        }
                        let record = self.get_record(generation_id).await?;
                        self.deliver_webhook(&record).await
                    }
                    DeliveryStrategy::X402 => {
                        let record = self.get_record(generation_id).await?;
                        self.slots.resolve(SlotOutcome {
                            generation_id: record.id.clone(),
                            status: record.status,
                            outputs: output_values(&record),
                            error: record.error.clone(),
                        });
                        Ok(())
                    }
                }
            }
            OrchestrationEvent::CastCompleted { cast_id, .. }
            | OrchestrationEvent::CastFailed { cast_id, .. } => {
                let cast = self
                    .casts
                    .get(cast_id)
                    .await
                    .map_err(|e| DispatchError::Store {
                        message: e.to_string(),
                    })?;
                self.deliver_cast(&cast, event).await
            }
            OrchestrationEvent::DepositCredited { user, credits, .. } => {
                tracing::debug!(user = %user, credits = credits.0, "deposit credited");
                Ok(())
            }
        }
    }

    /// Re-deliver a terminal generation's notification (manual operation).
    pub async fn reissue(&self, generation_id: &GenerationId) -> Result<()> {
        let record = self.get_record(generation_id).await?;
        if !record.is_terminal() {
            return Err(DispatchError::Delivery {
                message: "generation is not terminal".to_string(),
            });
        }
        let result = match record.delivery_strategy {
            DeliveryStrategy::Webhook => self.deliver_webhook(&record).await,
            DeliveryStrategy::Direct => self.deliver_direct(&record).await,
            _ => Err(DispatchError::Delivery {
                message: "delivery strategy is not reissuable".to_string(),
            }),
        };
        if result.is_ok() {
            self.clear_delivery_failure(generation_id).await;
        }
        result
    }

    async fn deliver_direct(&self, record: &GenerationRecord) -> Result<()> {
        let channel = self
            .channels
            .get(&record.platform)
            .ok_or(DispatchError::NoChannel {
                platform: record.platform,
            })?;
        let note = DeliveryNote {
            address: record.delivery_address.clone().unwrap_or_default(),
            reply_to: None,
            event: event_name(record),
            outputs: output_values(record),
            error: record.error.clone(),
            idempotency_key: record.id.to_string(),
        };
        match channel.deliver(&note).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_delivery_failed(&record.id).await;
                Err(err)
            }
        }
    }

    async fn deliver_webhook(&self, record: &GenerationRecord) -> Result<()> {
        let Some(target) = record.webhook.clone() else {
            return Err(DispatchError::Delivery {
                message: "record has no webhook target".to_string(),
            });
        };
        let payload = self.generation_payload(record);
        match self
            .webhooks
            .deliver(&target.url, target.secret.as_deref(), payload)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(generation = %record.id, error = %err, "webhook delivery exhausted");
                self.mark_delivery_failed(&record.id).await;
                Err(err)
            }
        }
    }

    async fn deliver_cast(&self, cast: &SpellCast, event: &OrchestrationEvent) -> Result<()> {
        let event_name = match event {
            OrchestrationEvent::CastCompleted { .. } => "spell.completed",
            _ => "spell.failed",
        };
        let final_outputs: Vec<Value> = cast
            .final_output
            .as_ref()
            .map(|o| o.0.values().cloned().collect())
            .unwrap_or_default();
        let error = match event {
            OrchestrationEvent::CastFailed { error, failed_step, .. } => Some(json!({
                "code": error.code,
                "message": error.message,
                "failed_step": failed_step,
            })),
            _ => None,
        };

        if let Some(webhook) = &cast.delivery.webhook {
            let mut payload = json!({
                "event": event_name,
                "cast_id": cast.id.to_string(),
                "status": cast_status_str(cast),
                "final_outputs": final_outputs,
                "cost_usd": self.usd_value(cast.accumulated_cost),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            if let (Some(error), Value::Object(map)) = (error.clone(), &mut payload) {
                map.insert("error".to_string(), error);
            }
            return self
                .webhooks
                .deliver(&webhook.url, webhook.secret.as_deref(), payload)
                .await;
        }

        if let Some(channel) = self.channels.get(&cast.delivery.platform) {
            let note = DeliveryNote {
                address: cast.delivery.address.clone().unwrap_or_default(),
                reply_to: cast.delivery.reply_to.clone(),
                event: event_name.to_string(),
                outputs: final_outputs,
                error: match event {
                    OrchestrationEvent::CastFailed { error, .. } => Some(error.clone()),
                    _ => None,
                },
                idempotency_key: cast.id.to_string(),
            };
            return channel.deliver(&note).await;
        }
        Ok(())
    }

    fn generation_payload(&self, record: &GenerationRecord) -> Value {
        let mut payload = json!({
            "event": event_name(record),
            "generation_id": record.id.to_string(),
            "status": record.status.to_string(),
            "outputs": output_values(record),
            "cost_usd": self.usd_value(record.cost.charged.unwrap_or(CreditAmount::zero())),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let (Some(error), Value::Object(map)) = (&record.error, &mut payload) {
            map.insert(
                "error".to_string(),
                json!({"code": error.code, "message": error.message}),
            );
        }
        payload
    }

    fn usd_value(&self, credits: CreditAmount) -> f64 {
        let rates = self.rates.read();
        let per_usd = rates.credit_rate.credits_per_usd;
        if per_usd.is_zero() {
            return 0.0;
        }
        (rust_decimal::Decimal::from(credits.0) / per_usd)
            .to_f64()
            .unwrap_or(0.0)
    }

    async fn get_record(&self, id: &GenerationId) -> Result<GenerationRecord> {
        self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => DispatchError::NotFound { id: id.to_string() },
            other => DispatchError::Store {
                message: other.to_string(),
            },
        })
    }

    /// Flag the generation as delivery-failed without touching its status:
    /// the work succeeded, only the notification did not.
    async fn mark_delivery_failed(&self, id: &GenerationId) {
        self.set_delivery_failed(id, true).await;
    }

    async fn clear_delivery_failure(&self, id: &GenerationId) {
        self.set_delivery_failed(id, false).await;
    }

    async fn set_delivery_failed(&self, id: &GenerationId, value: bool) {
        loop {
            let Ok(mut record) = self.store.get(id).await else { return };
            if record.delivery_failed == value {
                return;
            }
            record.delivery_failed = value;
            match self.store.update(record).await {
                Ok(_) => return,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => {
                    tracing::warn!(generation = %id, error = %err, "could not flag delivery state");
                    return;
                }
            }
        }
    }
}

fn event_name(record: &GenerationRecord) -> String {
    match record.status {
        GenerationStatus::Completed => "generation.completed".to_string(),
        GenerationStatus::Failed => "generation.failed".to_string(),
        other => format!("generation.{}", other),
    }
}

fn cast_status_str(cast: &SpellCast) -> &'static str {
    match cast.status {
        conjure_types::CastStatus::Running => "running",
        conjure_types::CastStatus::Completed => "completed",
        conjure_types::CastStatus::Failed => "failed",
        conjure_types::CastStatus::Cancelled => "cancelled",
    }
}

fn output_values(record: &GenerationRecord) -> Vec<Value> {
    record
        .outputs
        .as_ref()
        .map(|outputs| outputs.0.values().cloned().collect())
        .unwrap_or_default()
}
