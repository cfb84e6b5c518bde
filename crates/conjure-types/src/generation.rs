//! Generation records - the atomic unit of work and settlement

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{
    BackendJobId, CastId, CreditAmount, GenerationFailure, GenerationId, Platform, ToolId, UserId,
    WebhookTarget,
};

/// Lifecycle status of a generation.
///
/// Transitions are monotonic: `Queued → Running → (Completed | Failed |
/// Cancelled)`. Once terminal, a record is never transitioned again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is admissible.
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Completed) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Queued, Self::Cancelled) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// How a generation's terminal event is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// Deliver to the originating platform channel
    Direct,
    /// Hand off to the spell runner as a non-final step
    SpellStep,
    /// Hand off to the spell runner as the final step
    SpellFinal,
    /// POST to a user-supplied webhook URL
    Webhook,
    /// Resolve the HTTP response slot held open by the payment gate
    X402,
}

impl DeliveryStrategy {
    /// Whether the spell runner owns this generation's continuation.
    pub fn is_spell(&self) -> bool {
        matches!(self, Self::SpellStep | Self::SpellFinal)
    }
}

/// Quoted and charged cost of a generation.
///
/// `charged` is set exactly once at settlement and is never greater than
/// the quote plus the tool's declared tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRecord {
    pub quoted: CreditAmount,
    pub charged: Option<CreditAmount>,
}

impl CostRecord {
    pub fn quoted(quoted: CreditAmount) -> Self {
        Self {
            quoted,
            charged: None,
        }
    }
}

/// Validated, typed input snapshot for one generation.
///
/// Produced by registry validation; downstream consumers never re-parse.
/// A `BTreeMap` keeps key order deterministic for canonical serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedInputs(pub BTreeMap<String, serde_json::Value>);

impl NormalizedInputs {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output payload of a completed generation.
///
/// Outputs are named: spell bindings reference them by declared output
/// name, never by array position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload(pub BTreeMap<String, serde_json::Value>);

impl OutputPayload {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Durable record of one generation's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub user: UserId,
    pub tool_id: ToolId,
    pub inputs: NormalizedInputs,
    pub status: GenerationStatus,
    pub delivery_strategy: DeliveryStrategy,
    pub cost: CostRecord,
    /// Job id assigned by the backend, once submitted
    pub backend_job_id: Option<BackendJobId>,
    /// Present iff status is `Completed`
    pub outputs: Option<OutputPayload>,
    /// Present iff status is `Failed`
    pub error: Option<GenerationFailure>,
    /// Originating platform and address for direct delivery
    pub platform: Platform,
    pub delivery_address: Option<String>,
    /// Destination for webhook delivery, when requested
    pub webhook: Option<WebhookTarget>,
    /// Set when this generation is a spell step
    pub parent_cast_id: Option<CastId>,
    pub step_index: Option<usize>,
    /// Set once settlement (commit or release) has happened
    pub settled: bool,
    /// Set when a successful generation's notification exhausted delivery retries
    pub delivery_failed: bool,
    /// Optimistic concurrency version, bumped on every update
    pub version: u64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    /// Create a fresh `Queued` record.
    pub fn queued(
        user: UserId,
        tool_id: ToolId,
        inputs: NormalizedInputs,
        delivery_strategy: DeliveryStrategy,
        quoted: CreditAmount,
        platform: Platform,
    ) -> Self {
        Self {
            id: GenerationId::new(),
            user,
            tool_id,
            inputs,
            status: GenerationStatus::Queued,
            delivery_strategy,
            cost: CostRecord::quoted(quoted),
            backend_job_id: None,
            outputs: None,
            error: None,
            platform,
            delivery_address: None,
            webhook: None,
            parent_cast_id: None,
            step_index: None,
            settled: false,
            delivery_failed: false,
            version: 0,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            GenerationStatus::Completed,
            GenerationStatus::Failed,
            GenerationStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                GenerationStatus::Queued,
                GenerationStatus::Running,
                GenerationStatus::Completed,
                GenerationStatus::Failed,
                GenerationStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_queued_can_fail_directly() {
        // An insufficient-credits refusal fails the record without running.
        assert!(GenerationStatus::Queued.can_transition_to(GenerationStatus::Failed));
    }

    #[test]
    fn test_no_backwards_transition() {
        assert!(!GenerationStatus::Running.can_transition_to(GenerationStatus::Queued));
    }

    #[test]
    fn test_record_starts_unsettled() {
        let record = GenerationRecord::queued(
            UserId::new(),
            ToolId::from("t1"),
            NormalizedInputs::new(),
            DeliveryStrategy::Direct,
            CreditAmount::new(10),
            Platform::Api,
        );
        assert_eq!(record.status, GenerationStatus::Queued);
        assert!(!record.settled);
        assert_eq!(record.version, 0);
        assert!(record.outputs.is_none());
    }
}
