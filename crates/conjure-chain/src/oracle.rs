//! Price oracle seam
//!
//! One contract for all rate sources: `usd_price(asset)` at the moment of
//! the call. The observer fixes a deposit's USD value at confirmation time.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{ChainError, Result};

/// Source of USD prices per asset symbol
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, asset: &str) -> Result<Decimal>;
}

/// Fixed prices, for tests and stable-asset deployments
pub struct FixedPriceOracle {
    prices: Mutex<HashMap<String, Decimal>>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_price(&self, asset: impl Into<String>, price: Decimal) {
        self.prices.lock().unwrap().insert(asset.into(), price);
    }

    pub fn with_price(self, asset: impl Into<String>, price: Decimal) -> Self {
        self.set_price(asset, price);
        self
    }
}

impl Default for FixedPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn usd_price(&self, asset: &str) -> Result<Decimal> {
        self.prices
            .lock()
            .unwrap()
            .get(asset)
            .copied()
            .ok_or_else(|| ChainError::Oracle {
                message: format!("no price for asset '{}'", asset),
            })
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    usd: Decimal,
}

/// HTTP price service: `GET {base}/price/{symbol}` → `{"usd": "..."}`.
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn usd_price(&self, asset: &str) -> Result<Decimal> {
        let response = self
            .client
            .get(format!("{}/price/{}", self.base_url, asset))
            .send()
            .await
            .map_err(|e| ChainError::Oracle {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ChainError::Oracle {
                message: format!("HTTP {}", response.status()),
            });
        }
        let parsed: PriceResponse = response.json().await.map_err(|e| ChainError::Oracle {
            message: e.to_string(),
        })?;
        Ok(parsed.usd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fixed_oracle() {
        let oracle = FixedPriceOracle::new().with_price("USDC", dec!(1.0));
        assert_eq!(oracle.usd_price("USDC").await.unwrap(), dec!(1.0));
        assert!(oracle.usd_price("DOGE").await.is_err());
    }
}
