//! Delivery intents - where a generation's terminal event goes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Originating platform of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Telegram,
    Discord,
    Web,
    Api,
}

impl Platform {
    /// Display limit for tool descriptions on this platform, if any.
    pub fn description_limit(&self) -> Option<usize> {
        match self {
            Self::Telegram => Some(256),
            Self::Discord => Some(100),
            Self::Web | Self::Api => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Web => "web",
            Self::Api => "api",
        };
        write!(f, "{}", s)
    }
}

/// A user-supplied webhook destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    /// Shared secret for the HMAC signature, when provided
    pub secret: Option<String>,
}

/// Where and how to deliver a terminal event.
///
/// A generation has exactly one delivery intent at terminal status; for
/// most records this is a projection of fields already on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryIntent {
    pub platform: Platform,
    /// Channel-specific address (chat id, callback key)
    pub address: Option<String>,
    /// Correlator needed to render in place (chat message id to reply to)
    pub reply_to: Option<String>,
    pub webhook: Option<WebhookTarget>,
    /// Keys duplicate suppression at the receiver
    pub idempotency_key: Option<String>,
}

impl DeliveryIntent {
    pub fn api() -> Self {
        Self {
            platform: Platform::Api,
            address: None,
            reply_to: None,
            webhook: None,
            idempotency_key: None,
        }
    }

    pub fn chat(platform: Platform, address: impl Into<String>, reply_to: Option<String>) -> Self {
        Self {
            platform,
            address: Some(address.into()),
            reply_to,
            webhook: None,
            idempotency_key: None,
        }
    }

    pub fn webhook(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            platform: Platform::Api,
            address: None,
            reply_to: None,
            webhook: Some(WebhookTarget {
                url: url.into(),
                secret,
            }),
            idempotency_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_limits() {
        assert_eq!(Platform::Discord.description_limit(), Some(100));
        assert_eq!(Platform::Api.description_limit(), None);
    }

    #[test]
    fn test_webhook_intent() {
        let intent = DeliveryIntent::webhook("https://example.com/hook", Some("s3cret".into()));
        assert!(intent.webhook.is_some());
        assert_eq!(intent.platform, Platform::Api);
    }
}
