//! Conjure Chain - Deposit observation and reconciliation
//!
//! Watches deposit events on each configured chain and turns confirmed
//! deposits into ledger credits, exactly once per chain event:
//!
//! 1. Derive the chain event id (chain, tx hash, log index)
//! 2. Insert a `seen` deposit record, idempotently
//! 3. Advance to `confirmed` at the required depth
//! 4. Resolve the owning user (wallet link or magic-amount match)
//! 5. Price the deposit in USD at confirmation, convert to credits
//! 6. Credit the ledger keyed by the chain event id
//!
//! Crediting only happens at `confirmed`, so reorgs shallower than the
//! confirmation depth cannot corrupt the ledger.

pub mod linker;
pub mod observer;
pub mod oracle;
pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use conjure_types::{ChainEventId, DepositRecord, DepositState};

pub use linker::{LinkRequest, LinkState, WalletLinker};
pub use observer::{ChainObserver, ObserverConfig};
pub use oracle::{FixedPriceOracle, HttpPriceOracle, PriceOracle};
pub use rpc::{ChainRpc, DepositEvent, FakeChainRpc, HttpChainRpc};

/// Errors from chain observation
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("RPC error: {message}")]
    Rpc { message: String },

    #[error("Price oracle error: {message}")]
    Oracle { message: String },

    #[error("Deposit not found: {event_id}")]
    DepositNotFound { event_id: String },

    #[error("Invalid deposit state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: DepositState, to: DepositState },

    #[error("Ledger error: {message}")]
    Ledger { message: String },
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// In-memory store of deposit records, keyed by chain event id
#[derive(Clone, Default)]
pub struct DepositStore {
    deposits: Arc<RwLock<HashMap<ChainEventId, DepositRecord>>>,
}

impl DepositStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record in state `seen` if the event is new. Returns whether
    /// the record was inserted.
    pub async fn insert_seen(&self, record: DepositRecord) -> bool {
        let mut deposits = self.deposits.write().await;
        if deposits.contains_key(&record.event_id) {
            return false;
        }
        deposits.insert(record.event_id.clone(), record);
        true
    }

    pub async fn get(&self, event_id: &ChainEventId) -> Result<DepositRecord> {
        self.deposits
            .read()
            .await
            .get(event_id)
            .cloned()
            .ok_or_else(|| ChainError::DepositNotFound {
                event_id: event_id.to_string(),
            })
    }

    /// Apply `update` to the stored record, enforcing monotonic state
    /// transitions. Updates to terminal records are rejected.
    pub async fn modify<F>(&self, event_id: &ChainEventId, update: F) -> Result<DepositRecord>
    where
        F: FnOnce(&mut DepositRecord),
    {
        let mut deposits = self.deposits.write().await;
        let record = deposits
            .get_mut(event_id)
            .ok_or_else(|| ChainError::DepositNotFound {
                event_id: event_id.to_string(),
            })?;

        let before = record.state;
        update(record);
        if record.state != before && !before.can_advance_to(record.state) {
            let attempted = record.state;
            record.state = before;
            return Err(ChainError::InvalidTransition {
                from: before,
                to: attempted,
            });
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Records not yet in a terminal state
    pub async fn pending(&self) -> Vec<DepositRecord> {
        self.deposits
            .read()
            .await
            .values()
            .filter(|d| !d.state.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn count(&self, state: DepositState) -> usize {
        self.deposits
            .read()
            .await
            .values()
            .filter(|d| d.state == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_types::{ChainId, WalletAddress};

    fn record(n: u32) -> DepositRecord {
        DepositRecord::seen(
            ChainEventId::new(ChainId::new("base"), format!("0x{:x}", n), 0),
            WalletAddress::new("0xabc"),
            "USDC",
            "1000000",
            6,
            100,
            1,
        )
    }

    #[tokio::test]
    async fn test_insert_seen_idempotent() {
        let store = DepositStore::new();
        assert!(store.insert_seen(record(1)).await);
        assert!(!store.insert_seen(record(1)).await);
        assert_eq!(store.count(DepositState::Seen).await, 1);
    }

    #[tokio::test]
    async fn test_modify_enforces_monotonic_transitions() {
        let store = DepositStore::new();
        let r = record(1);
        let id = r.event_id.clone();
        store.insert_seen(r).await;

        // Seen -> Credited skips Confirmed and is rejected
        let err = store
            .modify(&id, |d| d.state = DepositState::Credited)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransition { .. }));

        store
            .modify(&id, |d| d.state = DepositState::Confirmed)
            .await
            .unwrap();
        store
            .modify(&id, |d| d.state = DepositState::Credited)
            .await
            .unwrap();

        // Terminal records are closed
        let err = store
            .modify(&id, |d| d.state = DepositState::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pending_excludes_terminal() {
        let store = DepositStore::new();
        let a = record(1);
        let b = record(2);
        let a_id = a.event_id.clone();
        store.insert_seen(a).await;
        store.insert_seen(b).await;
        store
            .modify(&a_id, |d| {
                d.state = DepositState::Rejected;
                d.reject_reason = Some("unsupported asset".to_string());
            })
            .await
            .unwrap();
        assert_eq!(store.pending().await.len(), 1);
    }
}
