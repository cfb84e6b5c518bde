//! Generation endpoints: execute, status, cancel, backend callbacks

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use conjure_engine::{CostAuthorization, ExecutionRequest};
use conjure_pricing::CostQuoter;
use conjure_registry::RegistryError;
use conjure_types::{
    BackendJobId, DeliveryStrategy, GenerationId, GenerationStatus, Platform, ToolId,
    WebhookTarget,
};

use crate::extract::{Authed, ReqId};
use crate::handlers::GenerationView;
use crate::state::AppState;
use crate::validate::validate_webhook_url;
use crate::ApiError;

#[derive(Debug, Deserialize)]
pub struct DeliverySpec {
    pub mode: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub tool_id: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub delivery: Option<DeliverySpec>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteAccepted {
    pub generation_id: String,
    pub status: String,
    pub check_after_ms: u64,
}

/// `POST /generations/execute`
pub async fn execute(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    let request_id = authed.request_id.0.clone();
    let tool_id = ToolId::new(body.tool_id.clone());

    let tool = state
        .registry
        .get(&tool_id)
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("tool '{}'", tool_id)))?;

    let inputs = state.registry.validate(&tool_id, &body.inputs).map_err(|err| {
        match err {
            RegistryError::ValidationFailed { errors, .. } => ApiError::new(
                400,
                "BAD_REQUEST",
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
                request_id.clone(),
            ),
            other => ApiError::internal(request_id.clone(), other.to_string()),
        }
    })?;

    // Optional webhook delivery
    let webhook = match &body.delivery {
        Some(spec) if spec.mode == "webhook" => {
            validate_webhook_url(&spec.url, state.config.production).map_err(|e| {
                ApiError::new(400, "BAD_REQUEST", e.to_string(), request_id.clone())
            })?;
            Some(WebhookTarget {
                url: spec.url.clone(),
                secret: spec.secret.clone(),
            })
        }
        Some(spec) => {
            return Err(ApiError::new(
                400,
                "BAD_REQUEST",
                format!("unknown delivery mode '{}'", spec.mode),
                request_id,
            ))
        }
        None => None,
    };

    let quote = {
        let rates = state.rates.read();
        CostQuoter::quote(&tool, &inputs, &rates)
            .map_err(|e| ApiError::new(400, "BAD_REQUEST", e.to_string(), request_id.clone()))?
    };

    let request = ExecutionRequest {
        generation_id: None,
        user: authed.user.clone(),
        tool_id,
        inputs,
        delivery_strategy: if webhook.is_some() {
            DeliveryStrategy::Webhook
        } else {
            DeliveryStrategy::Direct
        },
        platform: Platform::Api,
        delivery_address: None,
        webhook,
        parent_cast_id: None,
        step_index: None,
        quoted: quote.credits,
        authorization: CostAuthorization::Ledger,
    };

    let outcome = state
        .engine
        .execute(request)
        .await
        .map_err(|e| ApiError::from_conjure(&e, request_id.clone()))?;

    // Ledger refusals surface as a 402, not a 200-with-failed-record
    if let Some(error) = &outcome.error {
        if error.code == "INSUFFICIENT_CREDITS" {
            return Err(ApiError::new(402, "INSUFFICIENT_CREDITS", error.message.clone(),
                request_id));
        }
    }

    match outcome.status {
        GenerationStatus::Completed => Ok((
            StatusCode::OK,
            Json(json!({
                "generation_id": outcome.generation_id.to_string(),
                "status": "completed",
                "outputs": outcome.outputs,
            })),
        )
            .into_response()),
        GenerationStatus::Failed => {
            let error = outcome.error.unwrap_or_else(|| {
                conjure_types::GenerationFailure::new("INTERNAL", "generation failed")
            });
            let status = match error.code.as_str() {
                "BACKEND_TIMEOUT" => 504,
                "BACKEND_ERROR" => 502,
                _ => 500,
            };
            Err(ApiError::new(status, error.code, error.message, request_id))
        }
        _ => Ok((
            StatusCode::ACCEPTED,
            Json(ExecuteAccepted {
                generation_id: outcome.generation_id.to_string(),
                status: outcome.status.to_string(),
                check_after_ms: state.config.check_after_ms,
            }),
        )
            .into_response()),
    }
}

/// `GET /generations/:id`
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Path(id): Path<String>,
) -> Result<Json<GenerationView>, ApiError> {
    let request_id = authed.request_id.0.clone();
    let record = load_owned(&state, &authed, &id).await?;
    let _ = request_id;
    Ok(Json(GenerationView::from(&record)))
}

#[derive(Debug, Deserialize)]
pub struct BatchStatusBody {
    pub generation_ids: Vec<String>,
}

/// `POST /generations/status` - batch projection
pub async fn batch_status(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Json(body): Json<BatchStatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut views = Vec::with_capacity(body.generation_ids.len());
    for raw in &body.generation_ids {
        if let Ok(record) = load_owned(&state, &authed, raw).await {
            views.push(GenerationView::from(&record));
        }
    }
    Ok(Json(json!({ "generations": views })))
}

/// `POST /generations/:id/cancel`
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = authed.request_id.0.clone();
    let record = load_owned(&state, &authed, &id).await?;
    let status = state
        .engine
        .cancel(&record.id)
        .await
        .map_err(|e| ApiError::from_conjure(&e, request_id))?;
    Ok(Json(json!({
        "generation_id": record.id.to_string(),
        "status": status.to_string(),
    })))
}

/// `POST /callbacks/backend/:job_id` - inbound backend webhook.
///
/// Authenticated by the shared callback secret; idempotent by job id.
pub async fn backend_callback(
    State(state): State<Arc<AppState>>,
    request_id: ReqId,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let presented = headers
        .get("x-callback-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.config.backend_callback_secret {
        return Err(ApiError::new(
            401,
            "UNAUTHORIZED",
            "bad callback secret",
            request_id.0,
        ));
    }

    let status = state
        .engine
        .handle_backend_callback(&BackendJobId::new(job_id))
        .await
        .map_err(|e| ApiError::from_conjure(&e, request_id.0.clone()))?;
    Ok(Json(json!({ "status": status.to_string() })))
}

/// Load a generation and enforce ownership (foreign records read as 404).
async fn load_owned(
    state: &AppState,
    authed: &Authed,
    raw_id: &str,
) -> Result<conjure_types::GenerationRecord, ApiError> {
    let request_id = authed.request_id.0.clone();
    let id = GenerationId::parse(raw_id)
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("generation '{}'", raw_id)))?;
    let record = state
        .generations
        .get(&id)
        .await
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("generation '{}'", raw_id)))?;
    if record.user != authed.user {
        return Err(ApiError::not_found(
            request_id,
            format!("generation '{}'", raw_id),
        ));
    }
    Ok(record)
}
