//! Conjure Auth - Who is calling, and how often
//!
//! Three concerns, one crate:
//!
//! - [`ApiKeyService`]: keys are stored as SHA-256 digests; the plaintext
//!   exists only in the issue response
//! - [`SessionService`]: web sessions with a CSRF token checked on
//!   state-changing requests
//! - [`SlidingWindowLimiter`]: per-identity request limiting with a
//!   retry-after hint

pub mod api_key;
pub mod rate_limit;
pub mod session;

pub use api_key::{ApiKeyRecord, ApiKeyService};
pub use rate_limit::{RateLimitConfig, SlidingWindowLimiter};
pub use session::{Session, SessionService};

use thiserror::Error;

use conjure_types::UserId;

/// Errors from authentication
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    #[error("CSRF token missing or invalid")]
    CsrfMismatch,

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// A resolved caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Authenticated by API key
    ApiKey(UserId),
    /// Authenticated by web session
    Session(UserId),
    /// Unauthenticated x402 caller, identified per request
    Anonymous,
}

impl Identity {
    pub fn user(&self) -> Option<&UserId> {
        match self {
            Self::ApiKey(user) | Self::Session(user) => Some(user),
            Self::Anonymous => None,
        }
    }

    /// Key used for rate limiting
    pub fn rate_key(&self) -> String {
        match self {
            Self::ApiKey(user) => format!("key:{}", user),
            Self::Session(user) => format!("web:{}", user),
            Self::Anonymous => "anon".to_string(),
        }
    }
}
