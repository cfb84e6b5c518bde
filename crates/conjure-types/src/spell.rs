//! Spell definitions and casts - stored multi-step tool graphs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{
    CreditAmount, DeliveryIntent, GenerationId, InputField, SpellId, ToolId, UserId,
};

/// Where one step input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputBinding {
    /// A fixed value baked into the spell
    Literal { value: serde_json::Value },
    /// A parameter exposed at spell level
    Parameter { name: String },
    /// An output of an earlier step, referenced by declared output name
    StepOutput { step: usize, output: String },
}

/// One step of a spell: a tool plus its input bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellStep {
    pub tool_id: ToolId,
    /// Step input name → binding
    pub bindings: BTreeMap<String, InputBinding>,
}

/// A stored, versioned multi-step spell.
///
/// Published spells are immutable by (id, version); authors publish a new
/// version to evolve a spell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellDefinition {
    pub id: SpellId,
    pub version: u32,
    /// Human-facing handle used by `POST /spells/cast`
    pub slug: String,
    pub name: String,
    pub author: UserId,
    /// Exposed parameter set = the spell's public input schema
    pub parameters: Vec<InputField>,
    pub steps: Vec<SpellStep>,
    pub created_at: DateTime<Utc>,
}

impl SpellDefinition {
    pub fn parameter(&self, name: &str) -> Option<&InputField> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Validate internal structure: step-output bindings must point at an
    /// earlier step, parameter bindings at a declared parameter.
    pub fn check_bindings(&self) -> Result<(), BrokenBinding> {
        for (idx, step) in self.steps.iter().enumerate() {
            for (input, binding) in &step.bindings {
                match binding {
                    InputBinding::StepOutput { step: src, .. } if *src >= idx => {
                        return Err(BrokenBinding {
                            step_index: idx,
                            input: input.clone(),
                            reason: format!("references step {} which has not run yet", src),
                        });
                    }
                    InputBinding::Parameter { name } if self.parameter(name).is_none() => {
                        return Err(BrokenBinding {
                            step_index: idx,
                            input: input.clone(),
                            reason: format!("references undeclared parameter '{}'", name),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Structured error identifying the first broken binding of a cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokenBinding {
    pub step_index: usize,
    pub input: String,
    pub reason: String,
}

impl std::fmt::Display for BrokenBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step {} input '{}': {}",
            self.step_index, self.input, self.reason
        )
    }
}

/// Lifecycle status of a spell cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CastStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution of a spell definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellCast {
    pub id: crate::CastId,
    pub spell_id: SpellId,
    pub spell_version: u32,
    pub user: UserId,
    /// Caller-supplied parameter values
    pub parameters: HashMap<String, serde_json::Value>,
    /// Generation id per completed-or-running step; grows append-only
    pub generation_ids: Vec<GenerationId>,
    pub status: CastStatus,
    /// Index of the step currently running
    pub current_step: usize,
    /// Outputs of the final step, once completed
    pub final_output: Option<crate::OutputPayload>,
    /// Identifies the failing step when status is Failed
    pub failed_step: Option<usize>,
    pub accumulated_cost: CreditAmount,
    pub delivery: DeliveryIntent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
