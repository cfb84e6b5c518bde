//! Health and admin operations

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use conjure_types::GenerationId;

use crate::extract::{Admin, ReqId};
use crate::state::AppState;
use crate::ApiError;

/// `GET /health`
pub async fn health(
    State(state): State<Arc<AppState>>,
    _request_id: ReqId,
) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_seconds(),
        "catalog_version": state.registry.catalog_version(),
        "dispatch_queue_depth": state.pressure.depth(),
    }))
}

/// `POST /admin/tools/reload` - rebuild the catalog from all sources and
/// swap it in atomically.
pub async fn reload_tools(
    State(state): State<Arc<AppState>>,
    admin: Admin,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state
        .registry
        .reload(&state.catalog_sources)
        .await
        .map_err(|e| ApiError::internal(admin.request_id.0.clone(), e.to_string()))?;
    Ok(Json(json!({
        "tools": count,
        "catalog_version": state.registry.catalog_version(),
    })))
}

/// `POST /admin/deliveries/:id/reissue` - manual redelivery of a terminal
/// generation's notification.
pub async fn reissue_delivery(
    State(state): State<Arc<AppState>>,
    admin: Admin,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = admin.request_id.0;
    let id = GenerationId::parse(&raw)
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("generation '{}'", raw)))?;
    state
        .dispatcher
        .reissue(&id)
        .await
        .map_err(|e| ApiError::new(502, "DELIVERY_FAILED", e.to_string(), request_id))?;
    Ok(Json(json!({ "generation_id": raw, "reissued": true })))
}
