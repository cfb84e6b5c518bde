//! Magic-amount wallet linking endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use conjure_types::LinkRequestId;

use crate::extract::{Authed, ReqId};
use crate::state::AppState;
use crate::ApiError;

/// `POST /wallets/link/initiate`
///
/// The user deposits exactly the returned magic amount from the wallet
/// they want linked; the chain observer completes the link when the
/// deposit confirms.
pub async fn initiate_link(
    State(state): State<Arc<AppState>>,
    authed: Authed,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = state
        .linker
        .initiate(authed.user.clone(), state.config.link_asset.clone())
        .await;
    Ok(Json(json!({
        "request_id": request.id.to_string(),
        "deposit_address": state.config.deposit_address,
        "asset": request.asset,
        "magic_amount": request.magic_amount,
        "expires_at": request.expires_at.to_rfc3339(),
    })))
}

/// `GET /wallets/link/status/:request_id`
pub async fn link_status(
    State(state): State<Arc<AppState>>,
    request_id: ReqId,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = LinkRequestId::parse(&raw)
        .map_err(|_| ApiError::not_found(request_id.0.clone(), format!("link request '{}'", raw)))?;
    let link = state
        .linker
        .status(&id)
        .await
        .ok_or_else(|| ApiError::not_found(request_id.0.clone(), format!("link request '{}'", raw)))?;

    let status = match link.state {
        conjure_chain::LinkState::Pending => "pending",
        conjure_chain::LinkState::Completed => "completed",
        conjure_chain::LinkState::Expired => "expired",
    };
    Ok(Json(json!({
        "request_id": link.id.to_string(),
        "status": status,
        "wallet": link.wallet.map(|w| w.to_string()),
        "expires_at": link.expires_at.to_rfc3339(),
    })))
}
