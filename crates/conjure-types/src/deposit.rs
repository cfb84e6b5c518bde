//! Deposit records - one per observed on-chain deposit event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainEventId, UsdAmount, UserId, WalletAddress};

/// State of a deposit record. Transitions monotonically; `Credited` and
/// `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    /// Observed but not yet deep enough
    Seen,
    /// Reached the required confirmation depth
    Confirmed,
    /// Ledger credit appended
    Credited,
    /// Policy rejection (unsupported asset, unresolved owner, reorged out)
    Rejected,
}

impl DepositState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Credited | Self::Rejected)
    }

    /// Whether a transition from `self` to `next` is admissible.
    pub fn can_advance_to(&self, next: DepositState) -> bool {
        match (self, next) {
            (Self::Seen, Self::Confirmed) => true,
            (Self::Seen, Self::Rejected) => true,
            (Self::Confirmed, Self::Credited) => true,
            (Self::Confirmed, Self::Rejected) => true,
            _ => false,
        }
    }
}

/// One observed on-chain deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRecord {
    pub event_id: ChainEventId,
    pub wallet: WalletAddress,
    /// Asset symbol ("ETH", "USDC")
    pub asset: String,
    /// Raw on-chain amount in the asset's smallest unit, as a decimal string
    pub raw_amount: String,
    /// Asset decimals, for valuation
    pub decimals: u32,
    /// Block the event was observed in
    pub block_number: u64,
    /// USD value fixed at confirmation time
    pub usd_value: Option<UsdAmount>,
    /// Depth at last observation
    pub confirmations: u64,
    pub state: DepositState,
    /// Resolved owning user, once known
    pub user: Option<UserId>,
    /// Why a rejected deposit was rejected
    pub reject_reason: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositRecord {
    pub fn seen(
        event_id: ChainEventId,
        wallet: WalletAddress,
        asset: impl Into<String>,
        raw_amount: impl Into<String>,
        decimals: u32,
        block_number: u64,
        confirmations: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id,
            wallet,
            asset: asset.into(),
            raw_amount: raw_amount.into(),
            decimals,
            block_number,
            usd_value: None,
            confirmations,
            state: DepositState::Seen,
            user: None,
            reject_reason: None,
            observed_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChainId;

    #[test]
    fn test_terminal_states_do_not_advance() {
        assert!(!DepositState::Credited.can_advance_to(DepositState::Rejected));
        assert!(!DepositState::Rejected.can_advance_to(DepositState::Confirmed));
    }

    #[test]
    fn test_seen_cannot_skip_to_credited() {
        assert!(!DepositState::Seen.can_advance_to(DepositState::Credited));
        assert!(DepositState::Seen.can_advance_to(DepositState::Confirmed));
        assert!(DepositState::Confirmed.can_advance_to(DepositState::Credited));
    }

    #[test]
    fn test_new_record_is_seen() {
        let record = DepositRecord::seen(
            ChainEventId::new(ChainId::new("base"), "0xabc", 0),
            WalletAddress::new("0x1"),
            "USDC",
            "5000000",
            6,
            100,
            2,
        );
        assert_eq!(record.state, DepositState::Seen);
        assert!(record.user.is_none());
        assert!(record.usd_value.is_none());
    }
}
