//! The uniform error envelope

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use conjure_auth::AuthError;
use conjure_types::ConjureError;

/// Error body: `{"error": {"code", "message", "request_id"}}`
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip)]
    pub status: u16,
    /// Base64 payment requirements for 402 responses
    #[serde(skip)]
    pub payment_required_header: Option<String>,
    #[serde(skip)]
    pub payment_requirements: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>,
        request_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: request_id.into(),
            status,
            payment_required_header: None,
            payment_requirements: None,
        }
    }

    pub fn from_conjure(err: &ConjureError, request_id: impl Into<String>) -> Self {
        Self::new(err.http_status(), err.error_code(), err.to_string(), request_id)
    }

    pub fn from_auth(err: &AuthError, request_id: impl Into<String>) -> Self {
        let (status, code) = match err {
            AuthError::RateLimited { .. } => (429, "RATE_LIMITED"),
            AuthError::SessionExpired => (401, "UNAUTHORIZED"),
            AuthError::CsrfMismatch => (403, "FORBIDDEN"),
            AuthError::InvalidCredentials => (401, "UNAUTHORIZED"),
        };
        Self::new(status, code, err.to_string(), request_id)
    }

    pub fn internal(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(500, "INTERNAL", message, request_id)
    }

    pub fn not_found(request_id: impl Into<String>, what: impl std::fmt::Display) -> Self {
        Self::new(404, "NOT_FOUND", format!("{} not found", what), request_id)
    }

    /// Attach x402 payment requirements (402 responses only).
    pub fn with_payment_requirements(
        mut self,
        requirements: serde_json::Value,
        header: String,
    ) -> Self {
        self.payment_requirements = Some(requirements);
        self.payment_required_header = Some(header);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": self.request_id,
            }
        });
        if let Some(requirements) = &self.payment_requirements {
            body["payment_requirements"] = requirements.clone();
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(header) = &self.payment_required_header {
            if let Ok(value) = HeaderValue::from_str(header) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-payment-required"), value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }
        response
    }
}
