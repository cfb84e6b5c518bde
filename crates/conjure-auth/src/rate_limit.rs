//! Sliding-window rate limiting
//!
//! Request timestamps are kept per identity key within the window; a
//! request past the limit is refused with the time until the oldest
//! timestamp falls out of the window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::{AuthError, Result};

/// Limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    requests: Vec<Instant>,
}

/// Per-identity sliding-window limiter
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit or refuse one request for `key`.
    pub async fn check(&self, key: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                requests: Vec::new(),
            });

        bucket
            .requests
            .retain(|&t| now.duration_since(t) < self.config.window);

        if bucket.requests.len() >= self.config.max_requests as usize {
            let retry_after = bucket
                .requests
                .first()
                .map(|&oldest| {
                    self.config
                        .window
                        .saturating_sub(now.duration_since(oldest))
                })
                .unwrap_or(self.config.window);
            return Err(AuthError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        bucket.requests.push(now);
        Ok(())
    }

    /// Drop buckets with no requests inside the window.
    pub async fn expire_stale(&self) {
        let now = Instant::now();
        let window = self.config.window;
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| {
            bucket.requests.retain(|&t| now.duration_since(t) < window);
            !bucket.requests.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig {
            enabled: true,
            max_requests: max,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test]
    async fn test_limit_refuses_with_retry_after() {
        let limiter = limiter(2, 60_000);
        limiter.check("user:a").await.unwrap();
        limiter.check("user:a").await.unwrap();

        let err = limiter.check("user:a").await.unwrap_err();
        match err {
            AuthError::RateLimited { retry_after_ms } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // Other identities are unaffected
        limiter.check("user:b").await.unwrap();
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = limiter(1, 20);
        limiter.check("k").await.unwrap();
        assert!(limiter.check("k").await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.check("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            enabled: false,
            max_requests: 0,
            window: Duration::from_secs(60),
        });
        for _ in 0..100 {
            limiter.check("k").await.unwrap();
        }
    }
}
