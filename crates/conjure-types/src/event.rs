//! Terminal events emitted by the execution engine and spell runner
//!
//! Events are broadcast to all subscribers; the notification dispatcher is
//! the consumer that turns them into deliveries. Receivers are idempotent
//! by generation id: the bus guarantees at-least-once, not exactly-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CastId, ChainEventId, CreditAmount, DeliveryStrategy, GenerationFailure, GenerationId,
    SpellId, UserId,
};

/// Events produced during orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A generation reached `Completed`
    GenerationCompleted {
        generation_id: GenerationId,
        user: UserId,
        delivery_strategy: DeliveryStrategy,
        parent_cast_id: Option<CastId>,
        step_index: Option<usize>,
        charged: CreditAmount,
        timestamp: DateTime<Utc>,
    },

    /// A generation reached `Failed`
    GenerationFailed {
        generation_id: GenerationId,
        user: UserId,
        delivery_strategy: DeliveryStrategy,
        parent_cast_id: Option<CastId>,
        step_index: Option<usize>,
        error: GenerationFailure,
        timestamp: DateTime<Utc>,
    },

    /// A generation reached `Cancelled`
    GenerationCancelled {
        generation_id: GenerationId,
        user: UserId,
        delivery_strategy: DeliveryStrategy,
        parent_cast_id: Option<CastId>,
        step_index: Option<usize>,
        timestamp: DateTime<Utc>,
    },

    /// A spell cast reached `Completed`
    CastCompleted {
        cast_id: CastId,
        spell_id: SpellId,
        user: UserId,
        accumulated_cost: CreditAmount,
        timestamp: DateTime<Utc>,
    },

    /// A spell cast reached `Failed`
    CastFailed {
        cast_id: CastId,
        spell_id: SpellId,
        user: UserId,
        failed_step: usize,
        error: GenerationFailure,
        timestamp: DateTime<Utc>,
    },

    /// A confirmed deposit was credited to the ledger
    DepositCredited {
        event_id: ChainEventId,
        user: UserId,
        credits: CreditAmount,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::GenerationCompleted { timestamp, .. } => *timestamp,
            Self::GenerationFailed { timestamp, .. } => *timestamp,
            Self::GenerationCancelled { timestamp, .. } => *timestamp,
            Self::CastCompleted { timestamp, .. } => *timestamp,
            Self::CastFailed { timestamp, .. } => *timestamp,
            Self::DepositCredited { timestamp, .. } => *timestamp,
        }
    }

    /// The generation this event concerns, if any
    pub fn generation_id(&self) -> Option<&GenerationId> {
        match self {
            Self::GenerationCompleted { generation_id, .. } => Some(generation_id),
            Self::GenerationFailed { generation_id, .. } => Some(generation_id),
            Self::GenerationCancelled { generation_id, .. } => Some(generation_id),
            _ => None,
        }
    }

    /// Owning cast for spell-step events
    pub fn parent_cast_id(&self) -> Option<&CastId> {
        match self {
            Self::GenerationCompleted { parent_cast_id, .. }
            | Self::GenerationFailed { parent_cast_id, .. }
            | Self::GenerationCancelled { parent_cast_id, .. } => parent_cast_id.as_ref(),
            _ => None,
        }
    }

    /// Routing strategy for generation-terminal events
    pub fn delivery_strategy(&self) -> Option<DeliveryStrategy> {
        match self {
            Self::GenerationCompleted {
                delivery_strategy, ..
            }
            | Self::GenerationFailed {
                delivery_strategy, ..
            }
            | Self::GenerationCancelled {
                delivery_strategy, ..
            } => Some(*delivery_strategy),
            _ => None,
        }
    }

    /// Get a short description for logging
    pub fn summary(&self) -> String {
        match self {
            Self::GenerationCompleted {
                generation_id,
                charged,
                ..
            } => format!("generation {} completed ({})", generation_id, charged),
            Self::GenerationFailed {
                generation_id,
                error,
                ..
            } => format!("generation {} failed: {}", generation_id, error.code),
            Self::GenerationCancelled { generation_id, .. } => {
                format!("generation {} cancelled", generation_id)
            }
            Self::CastCompleted {
                cast_id,
                accumulated_cost,
                ..
            } => format!("cast {} completed ({})", cast_id, accumulated_cost),
            Self::CastFailed {
                cast_id,
                failed_step,
                ..
            } => format!("cast {} failed at step {}", cast_id, failed_step),
            Self::DepositCredited {
                event_id, credits, ..
            } => format!("deposit {} credited {}", event_id, credits),
        }
    }
}
