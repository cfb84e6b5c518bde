//! Error taxonomy for Conjure
//!
//! Stable error codes are part of the external contract: clients dispatch on
//! `error_code()`, the front door maps `http_status()`. Upstream failures are
//! classified into this taxonomy at the backend boundary and carried as
//! values from there on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Conjure operations
pub type Result<T> = std::result::Result<T, ConjureError>;

/// Conjure error taxonomy
#[derive(Debug, Clone, Error)]
pub enum ConjureError {
    // ========================================================================
    // Auth Errors
    // ========================================================================

    /// Missing or invalid credentials
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Authenticated but not allowed
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    /// Identity exceeded its request window
    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    // ========================================================================
    // Request Errors
    // ========================================================================

    /// Schema or URL validation failure
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// Unknown tool, spell, generation, or cast
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    // ========================================================================
    // Payment Errors
    // ========================================================================

    /// Ledger refused the reserve
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    /// x402 flow: the request must carry a payment authorization
    #[error("Payment required: {amount} {asset} on {chain} to {receiver}")]
    PaymentRequired {
        amount: String,
        asset: String,
        chain: String,
        receiver: String,
    },

    /// Replayed one-shot payment signature
    #[error("Payment signature already used")]
    PaymentAlreadyUsed,

    /// The external facilitator rejected the payment authorization
    #[error("Payment verification failed: {reason}")]
    PaymentVerificationFailed { reason: String },

    // ========================================================================
    // Backend Errors
    // ========================================================================

    /// Upstream exceeded its declared deadline
    #[error("Backend timeout for tool {tool_id} after {elapsed_ms}ms")]
    BackendTimeout { tool_id: String, elapsed_ms: u64 },

    /// Upstream error surfaced to the client
    #[error("Backend error: {message}")]
    BackendError { message: String },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================

    /// Client-visible terminal state, not an HTTP error per se
    #[error("Generation was cancelled")]
    Cancelled,

    /// Optimistic concurrency conflict on a stored record
    #[error("Version conflict on {kind} {id}: expected {expected}, found {found}")]
    VersionConflict {
        kind: String,
        id: String,
        expected: u64,
        found: u64,
    },

    /// Work succeeded but the terminal notification could not be delivered
    #[error("Delivery failed for generation {generation_id}: {reason}")]
    DeliveryFailed {
        generation_id: String,
        reason: String,
    },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Unexpected failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ConjureError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendError {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::BackendTimeout { .. }
                | Self::BackendError { .. }
                | Self::VersionConflict { .. }
                | Self::Internal { .. }
        )
    }

    /// Stable code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::InvalidInput { .. } => "BAD_REQUEST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::PaymentRequired { .. } => "PAYMENT_REQUIRED",
            Self::PaymentAlreadyUsed => "PAYMENT_ALREADY_USED",
            Self::PaymentVerificationFailed { .. } => "PAYMENT_VERIFICATION_FAILED",
            Self::BackendTimeout { .. } => "BACKEND_TIMEOUT",
            Self::BackendError { .. } => "BACKEND_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::VersionConflict { .. } => "INTERNAL",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// HTTP status the front door maps this error to
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::InvalidInput { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::InsufficientCredits { .. } => 402,
            Self::PaymentRequired { .. } => 402,
            Self::PaymentAlreadyUsed => 400,
            Self::PaymentVerificationFailed { .. } => 400,
            Self::BackendTimeout { .. } => 504,
            Self::BackendError { .. } => 502,
            Self::Cancelled => 200,
            Self::VersionConflict { .. } => 500,
            Self::DeliveryFailed { .. } => 500,
            Self::Internal { .. } => 500,
        }
    }
}

/// Error classification stored on a failed generation record.
///
/// Kept as plain strings so the stored record replays without depending on
/// the live error enum shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub code: String,
    pub message: String,
}

impl GenerationFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&ConjureError> for GenerationFailure {
    fn from(err: &ConjureError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
