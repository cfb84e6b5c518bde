//! Chain RPC seam
//!
//! The observer consumes [`ChainRpc`]; production uses the JSON-RPC
//! implementation against the configured node, tests use [`FakeChainRpc`]
//! with scripted events and reorgs.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use conjure_types::{ChainEventId, ChainId, WalletAddress};

use crate::{ChainError, Result};

/// One decoded deposit event from the ledger contract
#[derive(Debug, Clone)]
pub struct DepositEvent {
    pub event_id: ChainEventId,
    pub wallet: WalletAddress,
    pub asset: String,
    pub raw_amount: String,
    pub decimals: u32,
    pub block_number: u64,
}

/// Read-only view of one chain
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain(&self) -> &ChainId;

    async fn latest_block(&self) -> Result<u64>;

    /// Deposit events from the watched contract in `[from_block, to_block]`.
    async fn fetch_deposit_events(&self, from_block: u64, to_block: u64)
        -> Result<Vec<DepositEvent>>;
}

// ============================================================================
// JSON-RPC implementation
// ============================================================================

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct RawLog {
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "logIndex")]
    log_index: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    topics: Vec<String>,
    data: String,
}

/// Deposit(address indexed wallet, uint256 amount) on the ledger contract.
/// The asset and decimals are properties of the contract, configured per
/// chain rather than decoded from the log.
pub struct HttpChainRpc {
    chain: ChainId,
    client: reqwest::Client,
    url: String,
    contract_address: String,
    deposit_topic: String,
    asset: String,
    decimals: u32,
}

impl HttpChainRpc {
    pub fn new(
        chain: ChainId,
        url: impl Into<String>,
        contract_address: impl Into<String>,
        deposit_topic: impl Into<String>,
        asset: impl Into<String>,
        decimals: u32,
    ) -> Self {
        Self {
            chain,
            client: reqwest::Client::new(),
            url: url.into(),
            contract_address: contract_address.into(),
            deposit_topic: deposit_topic.into(),
            asset: asset.into(),
            decimals,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ChainError::Rpc {
                message: format!("HTTP {}", response.status()),
            });
        }
        let parsed: RpcResponse<T> = response.json().await.map_err(|e| ChainError::Rpc {
            message: e.to_string(),
        })?;
        if let Some(error) = parsed.error {
            return Err(ChainError::Rpc {
                message: error.message,
            });
        }
        parsed.result.ok_or_else(|| ChainError::Rpc {
            message: format!("{} returned no result", method),
        })
    }
}

fn parse_hex_u64(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|_| ChainError::Rpc {
        message: format!("invalid hex quantity '{}'", value),
    })
}

fn parse_hex_u128(value: &str) -> Result<u128> {
    u128::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|_| ChainError::Rpc {
        message: format!("invalid hex quantity '{}'", value),
    })
}

/// Last 20 bytes of a 32-byte topic are the address.
fn topic_to_address(topic: &str) -> Result<WalletAddress> {
    let hex = topic.trim_start_matches("0x");
    if hex.len() != 64 {
        return Err(ChainError::Rpc {
            message: format!("topic '{}' is not 32 bytes", topic),
        });
    }
    Ok(WalletAddress::new(format!("0x{}", &hex[24..])))
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn latest_block(&self) -> Result<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn fetch_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<DepositEvent>> {
        let logs: Vec<RawLog> = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": self.contract_address,
                    "topics": [self.deposit_topic],
                    "fromBlock": format!("0x{:x}", from_block),
                    "toBlock": format!("0x{:x}", to_block),
                }]),
            )
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let wallet = log
                .topics
                .get(1)
                .ok_or_else(|| ChainError::Rpc {
                    message: "deposit log missing wallet topic".to_string(),
                })
                .and_then(|t| topic_to_address(t))?;
            let amount = parse_hex_u128(&log.data)?;
            let log_index = parse_hex_u64(&log.log_index)? as u32;
            events.push(DepositEvent {
                event_id: ChainEventId::new(
                    self.chain.clone(),
                    log.transaction_hash.clone(),
                    log_index,
                ),
                wallet,
                asset: self.asset.clone(),
                raw_amount: amount.to_string(),
                decimals: self.decimals,
                block_number: parse_hex_u64(&log.block_number)?,
            });
        }
        Ok(events)
    }
}

// ============================================================================
// Fake for tests
// ============================================================================

/// Scripted chain: events and head height are set by the test. Removing an
/// event before it confirms simulates a reorg.
pub struct FakeChainRpc {
    chain: ChainId,
    state: Mutex<FakeChainState>,
}

struct FakeChainState {
    latest_block: u64,
    events: Vec<DepositEvent>,
}

impl FakeChainRpc {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            state: Mutex::new(FakeChainState {
                latest_block: 0,
                events: Vec::new(),
            }),
        }
    }

    pub fn set_latest_block(&self, block: u64) {
        self.state.lock().unwrap().latest_block = block;
    }

    pub fn push_event(&self, event: DepositEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    /// Drop an event from the canonical history (reorg simulation).
    pub fn remove_event(&self, event_id: &ChainEventId) {
        self.state
            .lock()
            .unwrap()
            .events
            .retain(|e| &e.event_id != event_id);
    }
}

#[async_trait]
impl ChainRpc for FakeChainRpc {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn latest_block(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().latest_block)
    }

    async fn fetch_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<DepositEvent>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }
}
