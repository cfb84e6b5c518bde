//! Request handlers, grouped by resource

pub mod admin;
pub mod generations;
pub mod spells;
pub mod tools;
pub mod wallets;
pub mod x402;

use serde::Serialize;

use conjure_types::{GenerationFailure, GenerationRecord, SpellCast};

/// Public projection of a generation record.
///
/// Internal record layout carries no wire-compat guarantee; this does.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationView {
    pub generation_id: String,
    pub tool_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GenerationFailure>,
    pub cost: CostView,
    pub delivery_failed: bool,
    pub queued_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostView {
    pub quoted_credits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charged_credits: Option<u64>,
}

impl From<&GenerationRecord> for GenerationView {
    fn from(record: &GenerationRecord) -> Self {
        Self {
            generation_id: record.id.to_string(),
            tool_id: record.tool_id.to_string(),
            status: record.status.to_string(),
            outputs: record
                .outputs
                .as_ref()
                .map(|o| serde_json::to_value(o).unwrap_or_default()),
            error: record.error.clone(),
            cost: CostView {
                quoted_credits: record.cost.quoted.0,
                charged_credits: record.cost.charged.map(|c| c.0),
            },
            delivery_failed: record.delivery_failed,
            queued_at: record.queued_at.to_rfc3339(),
            started_at: record.started_at.map(|t| t.to_rfc3339()),
            completed_at: record.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Public projection of a spell cast.
#[derive(Debug, Clone, Serialize)]
pub struct CastView {
    pub cast_id: String,
    pub spell_id: String,
    pub spell_version: u32,
    pub status: String,
    pub current_step: u32,
    pub generation_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_outputs: Option<serde_json::Value>,
    pub accumulated_cost_credits: u64,
    pub created_at: String,
}

impl From<&SpellCast> for CastView {
    fn from(cast: &SpellCast) -> Self {
        let status = match cast.status {
            conjure_types::CastStatus::Running => "running",
            conjure_types::CastStatus::Completed => "completed",
            conjure_types::CastStatus::Failed => "failed",
            conjure_types::CastStatus::Cancelled => "cancelled",
        };
        Self {
            cast_id: cast.id.to_string(),
            spell_id: cast.spell_id.to_string(),
            spell_version: cast.spell_version,
            status: status.to_string(),
            current_step: cast.current_step as u32,
            generation_ids: cast.generation_ids.iter().map(|g| g.to_string()).collect(),
            failed_step: cast.failed_step.map(|s| s as u32),
            final_outputs: cast
                .final_output
                .as_ref()
                .map(|o| serde_json::to_value(o).unwrap_or_default()),
            accumulated_cost_credits: cast.accumulated_cost.0,
            created_at: cast.created_at.to_rfc3339(),
        }
    }
}
