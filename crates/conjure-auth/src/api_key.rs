//! API key issuance and verification
//!
//! Keys look like `cjk_<48 hex chars>`. Only the SHA-256 digest is stored;
//! lookup is by digest, so a database dump never yields usable keys.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use conjure_types::UserId;

use crate::{AuthError, Result};

const KEY_PREFIX: &str = "cjk_";

/// Stored metadata for one issued key
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub user: UserId,
    pub label: String,
    /// First 8 characters of the plaintext, for display ("cjk_ab12…")
    pub display_prefix: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

/// API key service
#[derive(Clone, Default)]
pub struct ApiKeyService {
    /// digest(plaintext) → record
    keys: Arc<RwLock<HashMap<String, ApiKeyRecord>>>,
}

impl ApiKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Issue a new key. The plaintext is returned exactly once.
    pub async fn issue(&self, user: UserId, label: impl Into<String>) -> (String, ApiKeyRecord) {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        let plaintext = format!("{}{}", KEY_PREFIX, hex::encode(raw));

        let record = ApiKeyRecord {
            user,
            label: label.into(),
            display_prefix: plaintext.chars().take(8).collect(),
            created_at: Utc::now(),
            revoked: false,
        };
        self.keys
            .write()
            .await
            .insert(Self::digest(&plaintext), record.clone());
        (plaintext, record)
    }

    /// Resolve a presented key to its user.
    pub async fn authenticate(&self, presented: &str) -> Result<UserId> {
        if !presented.starts_with(KEY_PREFIX) {
            return Err(AuthError::InvalidCredentials);
        }
        let keys = self.keys.read().await;
        match keys.get(&Self::digest(presented)) {
            Some(record) if !record.revoked => Ok(record.user.clone()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// Revoke a key by its plaintext digest. Returns whether it existed.
    pub async fn revoke(&self, presented: &str) -> bool {
        let mut keys = self.keys.write().await;
        match keys.get_mut(&Self::digest(presented)) {
            Some(record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    /// All keys issued to a user (metadata only).
    pub async fn keys_for(&self, user: &UserId) -> Vec<ApiKeyRecord> {
        self.keys
            .read()
            .await
            .values()
            .filter(|r| &r.user == user)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let service = ApiKeyService::new();
        let user = UserId::new();
        let (plaintext, record) = service.issue(user.clone(), "ci").await;

        assert!(plaintext.starts_with("cjk_"));
        assert_eq!(record.display_prefix.len(), 8);
        assert_eq!(service.authenticate(&plaintext).await.unwrap(), user);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_keys_rejected() {
        let service = ApiKeyService::new();
        assert!(service.authenticate("cjk_deadbeef").await.is_err());
        assert!(service.authenticate("not-a-key").await.is_err());
    }

    #[tokio::test]
    async fn test_revoked_key_rejected() {
        let service = ApiKeyService::new();
        let (plaintext, _) = service.issue(UserId::new(), "ci").await;
        assert!(service.revoke(&plaintext).await);
        assert!(service.authenticate(&plaintext).await.is_err());
    }
}
