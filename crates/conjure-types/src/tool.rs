//! Tool definitions - the immutable catalog entries the registry serves

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BackendId, Platform, ToolId};

/// How the engine collects a tool's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Synchronous call within a bounded timeout
    Immediate,
    /// Backend calls us back with the job id
    Webhook,
    /// We poll the backend for job status
    Poll,
}

/// Declared cost model of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostModel {
    /// Flat cost per invocation
    Static { usd: rust_decimal::Decimal },
    /// Rate multiplied by a unit count derived from an input field
    PerUnit {
        usd_per_unit: rust_decimal::Decimal,
        /// Input field holding the unit count (e.g. image count)
        unit_field: String,
    },
    /// Historical average runtime times a per-GPU-second rate
    PerBackendSecond {
        /// Hardware class key into the rate book ("a100", "h100")
        hardware_class: String,
    },
}

/// Scalar type of an input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// URL of an input image or video asset
    Asset,
    /// One of a closed set of options
    Choice { options: Vec<String> },
}

/// Typed descriptor of one tool input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Applied when the field is absent and not required
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl InputField {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        kind: FieldKind,
        default: Option<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default,
            description: None,
        }
    }
}

/// Declared descriptor of one tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub description: Option<String>,
}

/// Which upstream service executes a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendBinding {
    pub backend: BackendId,
    /// Backend-local route or workflow name
    pub endpoint: String,
}

/// Who can discover a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    Internal,
}

/// Per-tool timing limits, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTimeouts {
    /// Poll-mode backoff ceiling; also the immediate-call deadline
    pub soft_ms: u64,
    /// Beyond this the generation fails with BACKEND_TIMEOUT
    pub hard_ms: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            soft_ms: 30_000,
            hard_ms: 600_000,
        }
    }
}

/// Immutable definition of one executable tool.
///
/// Definitions are loaded at startup and on reload events; a new version
/// replaces the old atomically, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    pub display_name: String,
    pub description: String,
    /// Platform command name ("/dream") → this tool
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub inputs: Vec<InputField>,
    pub outputs: Vec<OutputField>,
    pub delivery_mode: DeliveryMode,
    pub cost_model: CostModel,
    pub backend: BackendBinding,
    pub visibility: Visibility,
    #[serde(default)]
    pub timeouts: ToolTimeouts,
    /// Charged may exceed quoted by at most this fraction
    #[serde(default = "default_cost_tolerance")]
    pub cost_tolerance: f64,
    /// Accept inputs not declared in the schema
    #[serde(default)]
    pub allow_unknown_fields: bool,
    /// A success with no outputs counts as completed (otherwise BACKEND_ERROR)
    #[serde(default)]
    pub allow_empty_output: bool,
    /// Per-platform description variants, truncated at load time
    #[serde(default)]
    pub platform_descriptions: HashMap<Platform, String>,
}

fn default_cost_tolerance() -> f64 {
    0.1
}

impl ToolDefinition {
    pub fn input(&self, name: &str) -> Option<&InputField> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }
}
