//! Signed webhook delivery
//!
//! The canonicalisation rule is part of the external contract: the
//! signature is HMAC-SHA256 over the payload serialized with the
//! `signature` field omitted, keys in lexicographic order, compact
//! separators. Consumers recompute the HMAC over the exact bytes sent and
//! compare in constant time. `X-Webhook-Signature: sha256=<hex>` mirrors
//! the inline field.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use conjure_backends::{retry, BackendError, RetryPolicy};

use crate::{DispatchError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Serialize a payload canonically: `signature` omitted, keys sorted,
/// compact separators. serde_json's default map is ordered, so sorting
/// falls out of rebuilding the object.
pub fn canonical_payload(payload: &Value) -> Result<String> {
    let mut stripped = payload.clone();
    if let Value::Object(map) = &mut stripped {
        map.remove("signature");
    }
    serde_json::to_string(&stripped).map_err(|e| DispatchError::Payload {
        message: e.to_string(),
    })
}

/// Hex HMAC-SHA256 over the canonical payload.
pub fn sign_payload(secret: &str, payload: &Value) -> Result<String> {
    let canonical = canonical_payload(payload)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        DispatchError::Payload {
            message: e.to_string(),
        }
    })?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of an inbound or echoed signature.
pub fn verify_signature(secret: &str, payload: &Value, signature_hex: &str) -> bool {
    let Ok(canonical) = canonical_payload(payload) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// POSTs signed payloads to user-supplied URLs with bounded retries
pub struct WebhookDeliverer {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl WebhookDeliverer {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            retry_policy,
        }
    }

    /// Sign and deliver. Retries connect errors and 5xx responses on the
    /// configured schedule; any other response is final.
    pub async fn deliver(&self, url: &str, secret: Option<&str>, mut payload: Value) -> Result<()> {
        let signature = match secret {
            Some(secret) => Some(sign_payload(secret, &payload)?),
            None => None,
        };
        if let (Some(signature), Value::Object(map)) = (&signature, &mut payload) {
            map.insert(
                "signature".to_string(),
                Value::String(signature.clone()),
            );
        }

        let result = retry(&self.retry_policy, || {
            let payload = payload.clone();
            let signature = signature.clone();
            async move {
                let mut request = self.client.post(url).json(&payload);
                if let Some(signature) = &signature {
                    request = request.header(SIGNATURE_HEADER, format!("sha256={}", signature));
                }
                let response = request.send().await.map_err(|e| BackendError::Connect {
                    message: e.to_string(),
                })?;
                let status = response.status().as_u16();
                if (500..600).contains(&status) {
                    return Err(BackendError::Http {
                        status,
                        message: "retriable webhook failure".to_string(),
                    });
                }
                if !response.status().is_success() {
                    return Err(BackendError::Http {
                        status,
                        message: "webhook rejected".to_string(),
                    });
                }
                Ok(())
            }
        })
        .await;

        result.map_err(|e| DispatchError::Delivery {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_payload_omits_signature_and_sorts() {
        let payload = json!({
            "z_last": 1,
            "signature": "deadbeef",
            "a_first": true,
        });
        let canonical = canonical_payload(&payload).unwrap();
        assert_eq!(canonical, r#"{"a_first":true,"z_last":1}"#);
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let payload = json!({
            "event": "generation.completed",
            "generation_id": "gen_1",
            "outputs": ["https://cdn/a.png"],
        });
        let signature = sign_payload("s3cret", &payload).unwrap();
        assert!(verify_signature("s3cret", &payload, &signature));
        assert!(!verify_signature("wrong", &payload, &signature));

        // Signature stays valid with its own field embedded
        let mut with_sig = payload.clone();
        with_sig["signature"] = json!(signature.clone());
        assert!(verify_signature("s3cret", &with_sig, &signature));
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let payload = json!({"event": "generation.completed", "cost_usd": 0.1});
        let signature = sign_payload("s3cret", &payload).unwrap();
        let tampered = json!({"event": "generation.completed", "cost_usd": 0.0});
        assert!(!verify_signature("s3cret", &tampered, &signature));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(
            sign_payload("k", &a).unwrap(),
            sign_payload("k", &b).unwrap()
        );
    }
}
