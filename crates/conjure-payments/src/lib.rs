//! Conjure Payments - The x402 one-shot payment gate
//!
//! Anonymous one-off requests pay per generation instead of holding a
//! credit balance: the client retries a 402 response with a signed payment
//! authorization header, an external facilitator verifies it, and the
//! resulting authorization is good for exactly one generation. The core
//! never signs or settles payments itself.
//!
//! Replay is refused by claiming the signature before execution; the claim
//! is never returned, so a failed generation is not refunded (verification
//! and execution are indivisible in the external protocol) but the failure
//! is still reported to the client.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use conjure_types::{ConjureError, GenerationId, UsdAmount};

/// What the client must pay, carried in the 402 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequirements {
    pub receiver: String,
    /// Amount in the asset's atomic units
    pub amount_atomic: String,
    pub asset: String,
    pub chain: String,
}

impl PaymentRequirements {
    /// Base64 copy for the `X-Payment-Required` header.
    pub fn to_header_value(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(json)
    }
}

/// A facilitator-verified payment
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    /// The authorization signature, the one-shot idempotency key
    pub signature: String,
    pub payer: Option<String>,
}

/// External verifier of payment authorizations
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(
        &self,
        payment_header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, ConjureError>;
}

// ============================================================================
// Facilitator client
// ============================================================================

#[derive(Serialize)]
struct VerifyRequest<'a> {
    payment: &'a str,
    requirements: &'a PaymentRequirements,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// HTTP facilitator: `POST {base}/verify`
pub struct HttpFacilitator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFacilitator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentVerifier for HttpFacilitator {
    async fn verify(
        &self,
        payment_header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, ConjureError> {
        let response = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&VerifyRequest {
                payment: payment_header,
                requirements,
            })
            .send()
            .await
            .map_err(|e| ConjureError::PaymentVerificationFailed {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConjureError::PaymentVerificationFailed {
                reason: format!("facilitator returned HTTP {}", response.status()),
            });
        }

        let parsed: VerifyResponse =
            response
                .json()
                .await
                .map_err(|e| ConjureError::PaymentVerificationFailed {
                    reason: e.to_string(),
                })?;
        if !parsed.valid {
            return Err(ConjureError::PaymentVerificationFailed {
                reason: parsed.reason.unwrap_or_else(|| "invalid payment".to_string()),
            });
        }
        Ok(VerifiedPayment {
            signature: parsed.signature.unwrap_or_else(|| payment_header.to_string()),
            payer: parsed.payer,
        })
    }
}

/// Test verifier: accepts payments registered up front
#[derive(Default)]
pub struct FakeVerifier {
    accepted: DashMap<String, VerifiedPayment>,
}

impl FakeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, payment_header: impl Into<String>, signature: impl Into<String>) {
        let signature = signature.into();
        self.accepted.insert(
            payment_header.into(),
            VerifiedPayment {
                signature,
                payer: None,
            },
        );
    }
}

#[async_trait]
impl PaymentVerifier for FakeVerifier {
    async fn verify(
        &self,
        payment_header: &str,
        _requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, ConjureError> {
        self.accepted
            .get(payment_header)
            .map(|p| p.clone())
            .ok_or(ConjureError::PaymentVerificationFailed {
                reason: "unknown payment".to_string(),
            })
    }
}

// ============================================================================
// The gate
// ============================================================================

/// An authorization good for exactly one generation
#[derive(Debug, Clone)]
pub struct OneShotAuthorization {
    pub signature: String,
    pub payer: Option<String>,
}

/// Receiver-side configuration of the gate
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub receiver: String,
    pub asset: String,
    pub chain: String,
    /// Atomic units per USD for the configured asset (e.g. 1_000_000 for
    /// a 6-decimal stable asset)
    pub atomic_per_usd: u64,
}

/// Verifies one-shot payment authorizations and enforces single use
pub struct PaymentGate {
    verifier: Arc<dyn PaymentVerifier>,
    config: GateConfig,
    /// signature → the generation it paid for
    used: DashMap<String, Option<GenerationId>>,
}

impl PaymentGate {
    pub fn new(verifier: Arc<dyn PaymentVerifier>, config: GateConfig) -> Self {
        Self {
            verifier,
            config,
            used: DashMap::new(),
        }
    }

    /// Requirements for a quote, returned with 402 responses.
    pub fn requirements_for(&self, usd: UsdAmount) -> PaymentRequirements {
        let atomic = (usd.0 * rust_decimal_from(self.config.atomic_per_usd))
            .ceil()
            .normalize();
        PaymentRequirements {
            receiver: self.config.receiver.clone(),
            amount_atomic: atomic.to_string(),
            asset: self.config.asset.clone(),
            chain: self.config.chain.clone(),
        }
    }

    /// Verify a payment and claim its signature. The claim is permanent:
    /// a second call with the same underlying signature fails with
    /// `PAYMENT_ALREADY_USED` whatever happened to the first generation.
    pub async fn authorize(
        &self,
        payment_header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<OneShotAuthorization, ConjureError> {
        let verified = self.verifier.verify(payment_header, requirements).await?;

        match self.used.entry(verified.signature.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ConjureError::PaymentAlreadyUsed),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(None);
                Ok(OneShotAuthorization {
                    signature: verified.signature,
                    payer: verified.payer,
                })
            }
        }
    }

    /// Record which generation a claimed signature paid for.
    pub fn bind_generation(&self, signature: &str, generation_id: GenerationId) {
        if let Some(mut entry) = self.used.get_mut(signature) {
            *entry = Some(generation_id);
        }
    }

    /// The generation a signature paid for, if bound.
    pub fn generation_for(&self, signature: &str) -> Option<GenerationId> {
        self.used.get(signature).and_then(|entry| entry.clone())
    }
}

fn rust_decimal_from(value: u64) -> rust_decimal::Decimal {
    rust_decimal::Decimal::from(value)
}
