//! Spell endpoints: cast, cast status, cancel

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use conjure_spells::{SpellError, SpellRef};
use conjure_types::{CastId, DeliveryIntent, Platform, SpellId, WebhookTarget};

use crate::extract::Authed;
use crate::handlers::CastView;
use crate::state::AppState;
use crate::validate::validate_webhook_url;
use crate::ApiError;

#[derive(Debug, Deserialize)]
pub struct CastBody {
    #[serde(default)]
    pub spell_id: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub delivery: Option<super::generations::DeliverySpec>,
}

/// `POST /spells/cast`
pub async fn cast(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Json(body): Json<CastBody>,
) -> Result<Response, ApiError> {
    let request_id = authed.request_id.0.clone();

    let reference = match (&body.spell_id, &body.slug) {
        (Some(raw), _) => SpellRef::Id(SpellId::parse(raw).map_err(|_| {
            ApiError::not_found(request_id.clone(), format!("spell '{}'", raw))
        })?),
        (None, Some(slug)) => SpellRef::Slug(slug.clone()),
        (None, None) => {
            return Err(ApiError::new(
                400,
                "BAD_REQUEST",
                "spell_id or slug is required",
                request_id,
            ))
        }
    };

    let delivery = match &body.delivery {
        Some(spec) if spec.mode == "webhook" => {
            validate_webhook_url(&spec.url, state.config.production).map_err(|e| {
                ApiError::new(400, "BAD_REQUEST", e.to_string(), request_id.clone())
            })?;
            DeliveryIntent {
                platform: Platform::Api,
                address: None,
                reply_to: None,
                webhook: Some(WebhookTarget {
                    url: spec.url.clone(),
                    secret: spec.secret.clone(),
                }),
                idempotency_key: None,
            }
        }
        _ => DeliveryIntent::api(),
    };

    let cast = state
        .runner
        .cast(
            &reference,
            &body.parameters,
            authed.user.clone(),
            delivery,
            Platform::Api,
        )
        .await
        .map_err(|e| spell_error(e, request_id.clone()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "cast_id": cast.id.to_string(),
            "status": CastView::from(&cast).status,
        })),
    )
        .into_response())
}

/// `GET /spells/casts/:id`
pub async fn get_cast(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Path(id): Path<String>,
) -> Result<Json<CastView>, ApiError> {
    let cast = load_owned_cast(&state, &authed, &id).await?;
    Ok(Json(CastView::from(&cast)))
}

/// `POST /spells/casts/:id/cancel`
pub async fn cancel_cast(
    State(state): State<Arc<AppState>>,
    authed: Authed,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = authed.request_id.0.clone();
    let cast = load_owned_cast(&state, &authed, &id).await?;
    state
        .runner
        .cancel_cast(&cast.id)
        .await
        .map_err(|e| spell_error(e, request_id))?;
    Ok(Json(json!({
        "cast_id": cast.id.to_string(),
        "status": "cancelled",
    })))
}

async fn load_owned_cast(
    state: &AppState,
    authed: &Authed,
    raw_id: &str,
) -> Result<conjure_types::SpellCast, ApiError> {
    let request_id = authed.request_id.0.clone();
    let id = CastId::parse(raw_id)
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("cast '{}'", raw_id)))?;
    let cast = state
        .casts
        .get(&id)
        .await
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("cast '{}'", raw_id)))?;
    if cast.user != authed.user {
        return Err(ApiError::not_found(request_id, format!("cast '{}'", raw_id)));
    }
    Ok(cast)
}

fn spell_error(err: SpellError, request_id: String) -> ApiError {
    match &err {
        SpellError::SpellNotFound { .. } | SpellError::CastNotFound { .. } => {
            ApiError::new(404, "NOT_FOUND", err.to_string(), request_id)
        }
        SpellError::Parameters { .. } | SpellError::Binding(_) => {
            ApiError::new(400, "BAD_REQUEST", err.to_string(), request_id)
        }
        _ => ApiError::internal(request_id, err.to_string()),
    }
}
