//! Input schema validation and normalization
//!
//! Every tool input crosses this boundary exactly once. The output is a
//! typed [`NormalizedInputs`] snapshot; downstream consumers (engine, spell
//! runner) never re-parse raw payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conjure_types::{FieldKind, InputField, NormalizedInputs, ToolDefinition};

/// One validation failure, addressable by field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `raw` against the tool's declared schema.
///
/// Coerces types, applies defaults, and rejects unknown fields unless the
/// tool opts in. Collects every failure rather than stopping at the first.
pub fn validate_inputs(
    tool: &ToolDefinition,
    raw: &Value,
) -> Result<NormalizedInputs, Vec<FieldError>> {
    validate_fields(&tool.inputs, tool.allow_unknown_fields, raw)
}

/// Validate `raw` against an arbitrary field list. Spell parameter sets use
/// this with the same coercion rules as tool inputs.
pub fn validate_fields(
    fields: &[InputField],
    allow_unknown: bool,
    raw: &Value,
) -> Result<NormalizedInputs, Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut normalized = NormalizedInputs::new();

    let object = match raw {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(vec![FieldError::new(
                "$",
                format!("expected an object, got {}", kind_name(other)),
            )])
        }
    };

    for field in fields {
        match object.get(&field.name) {
            Some(value) => match coerce(&field.kind, value) {
                Ok(coerced) => normalized.insert(&field.name, coerced),
                Err(message) => errors.push(FieldError::new(&field.name, message)),
            },
            None if field.required => {
                errors.push(FieldError::new(&field.name, "required field is missing"))
            }
            None => {
                if let Some(default) = &field.default {
                    normalized.insert(&field.name, default.clone());
                }
            }
        }
    }

    for key in object.keys() {
        if !fields.iter().any(|f| f.name == *key) {
            if allow_unknown {
                normalized.insert(key, object[key].clone());
            } else {
                errors.push(FieldError::new(key, "unknown field"));
            }
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(errors)
    }
}

fn coerce(kind: &FieldKind, value: &Value) -> Result<Value, String> {
    match kind {
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(format!("expected a string, got {}", kind_name(other))),
        },
        FieldKind::Integer => match value {
            Value::Number(n) if n.is_u64() || n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .parse::<i64>()
                .map(|n| Value::from(n))
                .map_err(|_| format!("'{}' is not an integer", s)),
            other => Err(format!("expected an integer, got {}", kind_name(other))),
        },
        FieldKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not a number", s)),
            other => Err(format!("expected a number, got {}", kind_name(other))),
        },
        FieldKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            other => Err(format!("expected a boolean, got {}", kind_name(other))),
        },
        FieldKind::Asset => match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                Ok(value.clone())
            }
            Value::String(s) => Err(format!("'{}' is not an asset URL", s)),
            other => Err(format!("expected an asset URL, got {}", kind_name(other))),
        },
        FieldKind::Choice { options } => match value {
            Value::String(s) if options.contains(s) => Ok(value.clone()),
            Value::String(s) => Err(format!(
                "'{}' is not one of [{}]",
                s,
                options.join(", ")
            )),
            other => Err(format!("expected a choice, got {}", kind_name(other))),
        },
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_types::{
        BackendBinding, BackendId, CostModel, DeliveryMode, InputField, ToolId, ToolTimeouts,
        Visibility,
    };
    use serde_json::json;

    fn tool(inputs: Vec<InputField>, allow_unknown: bool) -> ToolDefinition {
        ToolDefinition {
            id: ToolId::from("t"),
            display_name: "t".to_string(),
            description: String::new(),
            command: None,
            category: None,
            inputs,
            outputs: vec![],
            delivery_mode: DeliveryMode::Immediate,
            cost_model: CostModel::Static {
                usd: rust_decimal::Decimal::ONE,
            },
            backend: BackendBinding {
                backend: BackendId::new("b"),
                endpoint: "e".to_string(),
            },
            visibility: Visibility::Public,
            timeouts: ToolTimeouts::default(),
            cost_tolerance: 0.1,
            allow_unknown_fields: allow_unknown,
            allow_empty_output: false,
            platform_descriptions: Default::default(),
        }
    }

    #[test]
    fn test_required_missing() {
        let t = tool(vec![InputField::required("prompt", FieldKind::String)], false);
        let errors = validate_inputs(&t, &json!({})).unwrap_err();
        assert_eq!(errors[0].field, "prompt");
    }

    #[test]
    fn test_default_applied() {
        let t = tool(
            vec![
                InputField::required("prompt", FieldKind::String),
                InputField::optional("steps", FieldKind::Integer, Some(json!(20))),
            ],
            false,
        );
        let normalized = validate_inputs(&t, &json!({"prompt": "a cat"})).unwrap();
        assert_eq!(normalized.get("steps"), Some(&json!(20)));
    }

    #[test]
    fn test_integer_coercion_from_string() {
        let t = tool(vec![InputField::required("steps", FieldKind::Integer)], false);
        let normalized = validate_inputs(&t, &json!({"steps": "25"})).unwrap();
        assert_eq!(normalized.get("steps"), Some(&json!(25)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let t = tool(vec![InputField::required("prompt", FieldKind::String)], false);
        let errors = validate_inputs(&t, &json!({"prompt": "x", "seed": 1})).unwrap_err();
        assert_eq!(errors[0].field, "seed");
        assert_eq!(errors[0].message, "unknown field");
    }

    #[test]
    fn test_unknown_field_passthrough_when_opted_in() {
        let t = tool(vec![InputField::required("prompt", FieldKind::String)], true);
        let normalized = validate_inputs(&t, &json!({"prompt": "x", "seed": 1})).unwrap();
        assert_eq!(normalized.get("seed"), Some(&json!(1)));
    }

    #[test]
    fn test_choice_validation() {
        let t = tool(
            vec![InputField::required(
                "size",
                FieldKind::Choice {
                    options: vec!["512".to_string(), "1024".to_string()],
                },
            )],
            false,
        );
        assert!(validate_inputs(&t, &json!({"size": "512"})).is_ok());
        assert!(validate_inputs(&t, &json!({"size": "2048"})).is_err());
    }

    #[test]
    fn test_asset_requires_url() {
        let t = tool(vec![InputField::required("image", FieldKind::Asset)], false);
        assert!(validate_inputs(&t, &json!({"image": "https://cdn/img.png"})).is_ok());
        assert!(validate_inputs(&t, &json!({"image": "not-a-url"})).is_err());
    }

    #[test]
    fn test_collects_all_errors() {
        let t = tool(
            vec![
                InputField::required("prompt", FieldKind::String),
                InputField::required("steps", FieldKind::Integer),
            ],
            false,
        );
        let errors = validate_inputs(&t, &json!({"steps": "abc", "extra": 1})).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_non_object_payload() {
        let t = tool(vec![], false);
        let errors = validate_inputs(&t, &json!([1, 2])).unwrap_err();
        assert_eq!(errors[0].field, "$");
    }
}
