//! Web sessions with CSRF protection

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tokio::sync::RwLock;

use conjure_types::UserId;

use crate::{AuthError, Result};

/// One active web session
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub csrf_token: String,
    pub user: UserId,
    pub expires_at: DateTime<Utc>,
}

fn random_token(prefix: &str) -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{}{}", prefix, hex::encode(raw))
}

/// Session issuance and verification
#[derive(Clone)]
pub struct SessionService {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn issue(&self, user: UserId) -> Session {
        let session = Session {
            token: random_token("cjs_"),
            csrf_token: random_token("csrf_"),
            user,
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Verify a session token. State-changing requests must also present
    /// the CSRF token.
    pub async fn authenticate(&self, token: &str, csrf: Option<&str>) -> Result<UserId> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(token).ok_or(AuthError::InvalidCredentials)?;
        if session.expires_at <= Utc::now() {
            return Err(AuthError::SessionExpired);
        }
        if let Some(presented) = csrf {
            if presented != session.csrf_token {
                return Err(AuthError::CsrfMismatch);
            }
        }
        Ok(session.user.clone())
    }

    /// Verify with CSRF required (mutating endpoints).
    pub async fn authenticate_mutating(&self, token: &str, csrf: Option<&str>) -> Result<UserId> {
        match csrf {
            Some(_) => self.authenticate(token, csrf).await,
            None => Err(AuthError::CsrfMismatch),
        }
    }

    pub async fn revoke(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Drop expired sessions. Returns how many were removed.
    pub async fn expire_stale(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_round_trip() {
        let service = SessionService::new(Duration::hours(1));
        let user = UserId::new();
        let session = service.issue(user.clone()).await;

        assert_eq!(
            service.authenticate(&session.token, None).await.unwrap(),
            user
        );
        assert_eq!(
            service
                .authenticate_mutating(&session.token, Some(&session.csrf_token))
                .await
                .unwrap(),
            user
        );
    }

    #[tokio::test]
    async fn test_mutating_requires_csrf() {
        let service = SessionService::new(Duration::hours(1));
        let session = service.issue(UserId::new()).await;

        assert!(matches!(
            service.authenticate_mutating(&session.token, None).await,
            Err(AuthError::CsrfMismatch)
        ));
        assert!(matches!(
            service
                .authenticate_mutating(&session.token, Some("csrf_wrong"))
                .await,
            Err(AuthError::CsrfMismatch)
        ));
    }

    #[tokio::test]
    async fn test_expired_session() {
        let service = SessionService::new(Duration::zero());
        let session = service.issue(UserId::new()).await;
        assert!(matches!(
            service.authenticate(&session.token, None).await,
            Err(AuthError::SessionExpired)
        ));
        assert_eq!(service.expire_stale().await, 1);
    }
}
