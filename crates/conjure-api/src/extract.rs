//! Request extractors: request ids and authenticated identity

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use conjure_types::UserId;

use crate::error::ApiError;
use crate::state::AppState;

/// Per-request correlation id, taken from `X-Request-Id` or minted.
#[derive(Debug, Clone)]
pub struct ReqId(pub String);

impl ReqId {
    fn from_parts(parts: &Parts) -> Self {
        let id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self(id)
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for ReqId {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

/// An authenticated, rate-limited caller.
///
/// Accepts an API key (`Authorization: Bearer cjk_…` or `X-Api-Key`) or a
/// web session (`X-Session-Token`, with `X-CSRF-Token` on mutating verbs).
#[derive(Debug, Clone)]
pub struct Authed {
    pub user: UserId,
    pub request_id: ReqId,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let request_id = ReqId::from_parts(parts);

        let api_key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| {
                parts
                    .headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(String::from)
            });

        let user = if let Some(key) = api_key {
            state
                .api_keys
                .authenticate(&key)
                .await
                .map_err(|e| ApiError::from_auth(&e, request_id.0.clone()))?
        } else if let Some(token) = parts
            .headers
            .get("x-session-token")
            .and_then(|v| v.to_str().ok())
        {
            let csrf = parts
                .headers
                .get("x-csrf-token")
                .and_then(|v| v.to_str().ok());
            let mutating = !matches!(
                parts.method.as_str(),
                "GET" | "HEAD" | "OPTIONS"
            );
            let result = if mutating {
                state.sessions.authenticate_mutating(token, csrf).await
            } else {
                state.sessions.authenticate(token, csrf).await
            };
            result.map_err(|e| ApiError::from_auth(&e, request_id.0.clone()))?
        } else {
            return Err(ApiError::new(
                401,
                "UNAUTHORIZED",
                "missing credentials",
                request_id.0.clone(),
            ));
        };

        // Rate limit inside the sliding window, keyed by identity
        state
            .limiter
            .check(&format!("user:{}", user))
            .await
            .map_err(|e| ApiError::from_auth(&e, request_id.0.clone()))?;

        Ok(Authed { user, request_id })
    }
}

/// Admin surface guard: `Authorization: Bearer <admin token>`.
#[derive(Debug, Clone)]
pub struct Admin {
    pub request_id: ReqId,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let request_id = ReqId::from_parts(parts);
        let presented = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if !state.config.admin_token.is_empty()
                && token == state.config.admin_token =>
            {
                Ok(Admin { request_id })
            }
            _ => Err(ApiError::new(
                403,
                "FORBIDDEN",
                "admin token required",
                request_id.0,
            )),
        }
    }
}
