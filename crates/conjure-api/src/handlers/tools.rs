//! Tool discovery endpoints

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use conjure_registry::ToolFilter;
use conjure_types::{ToolDefinition, ToolId};

use crate::extract::ReqId;
use crate::state::AppState;
use crate::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub category: Option<String>,
}

/// Public projection of a tool definition
#[derive(Debug, Serialize)]
pub struct ToolView {
    pub id: String,
    pub display_name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub delivery_mode: String,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
}

impl From<&ToolDefinition> for ToolView {
    fn from(tool: &ToolDefinition) -> Self {
        let delivery_mode = match tool.delivery_mode {
            conjure_types::DeliveryMode::Immediate => "immediate",
            conjure_types::DeliveryMode::Webhook => "webhook",
            conjure_types::DeliveryMode::Poll => "poll",
        };
        Self {
            id: tool.id.to_string(),
            display_name: tool.display_name.clone(),
            description: tool.description.clone(),
            category: tool.category.clone(),
            delivery_mode: delivery_mode.to_string(),
            inputs: serde_json::to_value(&tool.inputs).unwrap_or_default(),
            outputs: serde_json::to_value(&tool.outputs).unwrap_or_default(),
        }
    }
}

/// `GET /tools`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let tools: Vec<ToolView> = state
        .registry
        .list(&ToolFilter {
            category: query.category,
            include_hidden: false,
        })
        .iter()
        .map(|t| ToolView::from(t.as_ref()))
        .collect();
    Json(json!({ "tools": tools }))
}

/// `GET /tools/:id`
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    request_id: ReqId,
    Path(id): Path<String>,
) -> Result<Json<ToolView>, ApiError> {
    let tool = state
        .registry
        .get(&ToolId::new(id.clone()))
        .map_err(|_| ApiError::not_found(request_id.0.clone(), format!("tool '{}'", id)))?;
    if !tool.is_public() {
        return Err(ApiError::not_found(request_id.0, format!("tool '{}'", id)));
    }
    Ok(Json(ToolView::from(tool.as_ref())))
}
