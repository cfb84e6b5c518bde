//! One-shot payment execution (x402)
//!
//! A request without a payment authorization receives a 402 carrying the
//! payment requirements (body and `X-Payment-Required` header). A request
//! with one is verified against the facilitator, claimed for single use,
//! and executed while the HTTP response slot stays open until the
//! generation reaches terminal state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use conjure_engine::{CostAuthorization, ExecutionRequest};
use conjure_pricing::CostQuoter;
use conjure_registry::RegistryError;
use conjure_types::{ConjureError, DeliveryStrategy, GenerationStatus, Platform, ToolId};

use crate::extract::ReqId;
use crate::state::AppState;
use crate::ApiError;

#[derive(Debug, Deserialize)]
pub struct X402Body {
    pub tool_id: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    /// Payment authorization; `X-Payment` header takes precedence
    #[serde(default)]
    pub payment: Option<String>,
}

/// `POST /x402/execute`
pub async fn execute(
    State(state): State<Arc<AppState>>,
    request_id: ReqId,
    headers: HeaderMap,
    Json(body): Json<X402Body>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = request_id.0;
    let tool_id = ToolId::new(body.tool_id.clone());

    let tool = state
        .registry
        .get(&tool_id)
        .map_err(|_| ApiError::not_found(request_id.clone(), format!("tool '{}'", tool_id)))?;

    let inputs = state
        .registry
        .validate(&tool_id, &body.inputs)
        .map_err(|err| match err {
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
        })?;

    let quote = {
        let rates = state.rates.read();
        CostQuoter::quote(&tool, &inputs, &rates)
            .map_err(|e| ApiError::new(400, "BAD_REQUEST", e.to_string(), request_id.clone()))?
    };
    let requirements = state.gate.requirements_for(quote.usd);

    // No payment: answer 402 with the requirements
    let payment = headers
        .get("x-payment")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or(body.payment.clone());
    let Some(payment) = payment else {
        let err = ConjureError::PaymentRequired {
            amount: requirements.amount_atomic.clone(),
            asset: requirements.asset.clone(),
            chain: requirements.chain.clone(),
            receiver: requirements.receiver.clone(),
        };
        return Err(ApiError::from_conjure(&err, request_id).with_payment_requirements(
            serde_json::to_value(&requirements).unwrap_or_default(),
            requirements.to_header_value(),
        ));
    };

    // Verify and claim the signature: exactly one generation per payment
    let authorization = state
        .gate
        .authorize(&payment, &requirements)
        .await
        .map_err(|e| ApiError::from_conjure(&e, request_id.clone()))?;

    // Anonymous per-payment user identity; the generation id is assigned
    // up front so the response slot is open before execution starts.
    let user = conjure_types::UserId::new();
    let generation_id = conjure_types::GenerationId::new();
    let slot = state.slots.open(generation_id.clone());
    state
        .gate
        .bind_generation(&authorization.signature, generation_id.clone());

    let request = ExecutionRequest {
        generation_id: Some(generation_id.clone()),
        user,
        tool_id,
        inputs,
        delivery_strategy: DeliveryStrategy::X402,
        platform: Platform::Api,
        delivery_address: None,
        webhook: None,
        parent_cast_id: None,
        step_index: None,
        quoted: quote.credits,
        authorization: CostAuthorization::OneShot,
    };

    let outcome = match state.engine.execute(request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            // Payment stays claimed; the protocol treats verify-and-execute
            // as indivisible. Report the failure.
            return Err(ApiError::from_conjure(&err, request_id));
        }
    };

    // Wait on the slot for the terminal outcome (immediate tools resolve
    // it before execute even returns).
    let resolved = tokio::time::timeout(
        state.config.immediate_wait.max(Duration::from_millis(100)),
        slot,
    )
    .await;

    match resolved {
        Ok(Ok(outcome)) => match outcome.status {
            GenerationStatus::Completed => Ok(Json(json!({
                "generation_id": outcome.generation_id.to_string(),
                "status": "completed",
                "outputs": outcome.outputs,
            }))),
            status => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| conjure_types::GenerationFailure::new(
                        "INTERNAL", "generation did not complete"));
                let http = match error.code.as_str() {
                    "BACKEND_TIMEOUT" => 504,
                    "BACKEND_ERROR" => 502,
                    _ if status == GenerationStatus::Cancelled => 200,
                    _ => 500,
                };
                Err(ApiError::new(http, error.code, error.message, request_id))
            }
        },
        // Slot still open: return the handle, the client can poll
        _ => Ok(Json(json!({
            "generation_id": outcome.generation_id.to_string(),
            "status": outcome.status.to_string(),
            "check_after_ms": state.config.check_after_ms,
        }))),
    }
}
