//! The chain observer worker
//!
//! One observer per watched chain. Each tick re-scans a window of recent
//! blocks (the confirmation depth), inserts new events as `seen`, rejects
//! records whose event disappeared from the canonical range, advances
//! confirmations, and credits confirmed deposits exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch, RwLock};

use conjure_ledger::CreditLedger;
use conjure_types::{
    CreditRate, DepositRecord, DepositState, OrchestrationEvent, UsdAmount, UserId,
};

use crate::{
    ChainError, ChainRpc, DepositEvent, DepositStore, PriceOracle, Result, WalletLinker,
};

/// Per-chain observer configuration
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub confirmation_depth: u64,
    pub supported_assets: HashSet<String>,
    pub credit_rate: CreditRate,
    /// A confirmed deposit whose owner stays unresolved this long is rejected
    pub owner_timeout: chrono::Duration,
    pub poll_interval: StdDuration,
    pub max_backoff: StdDuration,
}

/// Watches one chain and reconciles its deposits into the ledger
pub struct ChainObserver {
    rpc: Arc<dyn ChainRpc>,
    deposits: DepositStore,
    ledger: CreditLedger,
    linker: WalletLinker,
    oracle: Arc<dyn PriceOracle>,
    events: broadcast::Sender<OrchestrationEvent>,
    config: ObserverConfig,
    /// First block not yet scanned; the restart high-water mark
    next_block: RwLock<u64>,
}

impl ChainObserver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        deposits: DepositStore,
        ledger: CreditLedger,
        linker: WalletLinker,
        oracle: Arc<dyn PriceOracle>,
        events: broadcast::Sender<OrchestrationEvent>,
        config: ObserverConfig,
        start_block: u64,
    ) -> Self {
        Self {
            rpc,
            deposits,
            ledger,
            linker,
            oracle,
            events,
            config,
            next_block: RwLock::new(start_block),
        }
    }

    /// The restartable high-water mark.
    pub async fn high_water(&self) -> u64 {
        *self.next_block.read().await
    }

    /// One observation pass. Returns the number of deposits credited.
    pub async fn tick(&self) -> Result<usize> {
        let latest = self.rpc.latest_block().await?;
        let next = *self.next_block.read().await;
        if latest == 0 || latest < next.saturating_sub(1) {
            return Ok(0);
        }

        // Re-scan the confirmation window so reorged-out events are caught.
        let window_start = next.saturating_sub(self.config.confirmation_depth).max(1);
        let events = self
            .rpc
            .fetch_deposit_events(window_start, latest)
            .await?;

        let canonical: HashSet<_> = events.iter().map(|e| e.event_id.clone()).collect();
        for event in events {
            self.observe_event(event).await;
        }

        // Reject pending records that vanished from the canonical range.
        for record in self.deposits.pending().await {
            if record.event_id.chain != *self.rpc.chain() {
                continue;
            }
            if record.block_number >= window_start
                && record.block_number <= latest
                && !canonical.contains(&record.event_id)
            {
                tracing::warn!(event = %record.event_id, "deposit reorged out before confirmation");
                let _ = self
                    .deposits
                    .modify(&record.event_id, |d| {
                        d.state = DepositState::Rejected;
                        d.reject_reason = Some("reorged out".to_string());
                    })
                    .await;
            }
        }

        let credited = self.advance_pending(latest).await?;
        *self.next_block.write().await = latest + 1;
        Ok(credited)
    }

    async fn observe_event(&self, event: DepositEvent) {
        let record = DepositRecord::seen(
            event.event_id.clone(),
            event.wallet,
            event.asset,
            event.raw_amount,
            event.decimals,
            event.block_number,
            0,
        );
        if self.deposits.insert_seen(record).await {
            tracing::info!(event = %event.event_id, block = event.block_number, "deposit seen");
        }
    }

    /// Advance confirmations and credit everything that is ready.
    async fn advance_pending(&self, latest: u64) -> Result<usize> {
        let mut credited = 0;
        for record in self.deposits.pending().await {
            if record.event_id.chain != *self.rpc.chain() {
                continue;
            }
            let confirmations = latest.saturating_sub(record.block_number) + 1;

            let record = self
                .deposits
                .modify(&record.event_id, |d| {
                    d.confirmations = confirmations;
                    if d.state == DepositState::Seen
                        && confirmations >= self.config.confirmation_depth
                    {
                        d.state = DepositState::Confirmed;
                    }
                })
                .await?;

            if record.state == DepositState::Confirmed && self.settle_confirmed(&record).await? {
                credited += 1;
            }
        }
        Ok(credited)
    }

    /// Price, resolve the owner, and credit one confirmed deposit.
    /// Returns true when a credit was appended.
    async fn settle_confirmed(&self, record: &DepositRecord) -> Result<bool> {
        if !self.config.supported_assets.contains(&record.asset) {
            self.reject(record, "unsupported asset").await?;
            return Ok(false);
        }

        let Some(user) = self.resolve_owner(record).await else {
            // Leave unresolved deposits pending until the timeout
            if Utc::now() - record.observed_at > self.config.owner_timeout {
                self.reject(record, "owner unresolved after timeout").await?;
            }
            return Ok(false);
        };

        let price = self.oracle.usd_price(&record.asset).await?;
        let usd = deposit_usd_value(&record.raw_amount, record.decimals, price)?;
        let credits = self
            .config
            .credit_rate
            .to_credits(usd)
            .map_err(|e| ChainError::Ledger {
                message: e.to_string(),
            })?;

        self.ledger
            .credit(&record.event_id, &user, credits)
            .await
            .map_err(|e| ChainError::Ledger {
                message: e.to_string(),
            })?;

        self.deposits
            .modify(&record.event_id, |d| {
                d.state = DepositState::Credited;
                d.user = Some(user.clone());
                d.usd_value = Some(usd);
            })
            .await?;

        tracing::info!(
            event = %record.event_id,
            user = %user,
            credits = credits.0,
            "deposit credited"
        );
        let _ = self.events.send(OrchestrationEvent::DepositCredited {
            event_id: record.event_id.clone(),
            user,
            credits,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    async fn resolve_owner(&self, record: &DepositRecord) -> Option<UserId> {
        if let Some(user) = self.linker.owner_of(&record.wallet).await {
            return Some(user);
        }
        self.linker
            .match_deposit(&record.asset, &record.raw_amount, &record.wallet)
            .await
    }

    async fn reject(&self, record: &DepositRecord, reason: &str) -> Result<()> {
        tracing::warn!(event = %record.event_id, reason, "deposit rejected");
        self.deposits
            .modify(&record.event_id, |d| {
                d.state = DepositState::Rejected;
                d.reject_reason = Some(reason.to_string());
            })
            .await?;
        Ok(())
    }

    /// Observation loop: tick at the configured interval, backing off
    /// exponentially on RPC failure, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.poll_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    tracing::info!(chain = %self.rpc.chain(), "chain observer stopping");
                    return;
                }
            }

            match self.tick().await {
                Ok(_) => backoff = self.config.poll_interval,
                Err(err) => {
                    tracing::warn!(chain = %self.rpc.chain(), error = %err, "observer tick failed");
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }
}

fn deposit_usd_value(raw_amount: &str, decimals: u32, price: Decimal) -> Result<UsdAmount> {
    let raw: Decimal = raw_amount.parse().map_err(|_| ChainError::Ledger {
        message: format!("unparseable deposit amount '{}'", raw_amount),
    })?;
    let scale = Decimal::new(1, decimals);
    let normalized = raw.checked_mul(scale).ok_or_else(|| ChainError::Ledger {
        message: "deposit amount overflow".to_string(),
    })?;
    let usd = normalized.checked_mul(price).ok_or_else(|| ChainError::Ledger {
        message: "deposit valuation overflow".to_string(),
    })?;
    Ok(UsdAmount::new(usd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeChainRpc, FixedPriceOracle};
    use conjure_types::{ChainEventId, ChainId, CreditAmount, WalletAddress};
    use rust_decimal_macros::dec;

    fn config() -> ObserverConfig {
        ObserverConfig {
            confirmation_depth: 5,
            supported_assets: HashSet::from(["USDC".to_string()]),
            credit_rate: CreditRate::new(dec!(100)),
            owner_timeout: chrono::Duration::hours(1),
            poll_interval: StdDuration::from_millis(10),
            max_backoff: StdDuration::from_secs(1),
        }
    }

    struct Fixture {
        rpc: Arc<FakeChainRpc>,
        observer: ChainObserver,
        ledger: CreditLedger,
        linker: WalletLinker,
        deposits: DepositStore,
    }

    fn fixture() -> Fixture {
        let rpc = Arc::new(FakeChainRpc::new(ChainId::new("base")));
        let ledger = CreditLedger::new();
        let linker = WalletLinker::new(chrono::Duration::hours(1), 1_000_000);
        let deposits = DepositStore::new();
        let oracle = Arc::new(FixedPriceOracle::new().with_price("USDC", dec!(1.0)));
        let (events, _) = broadcast::channel(64);
        let observer = ChainObserver::new(
            rpc.clone(),
            deposits.clone(),
            ledger.clone(),
            linker.clone(),
            oracle,
            events,
            config(),
            1,
        );
        Fixture {
            rpc,
            observer,
            ledger,
            linker,
            deposits,
        }
    }

    fn deposit_event(tx: &str, block: u64, wallet: &str, raw: &str) -> DepositEvent {
        DepositEvent {
            event_id: ChainEventId::new(ChainId::new("base"), tx, 0),
            wallet: WalletAddress::new(wallet),
            asset: "USDC".to_string(),
            raw_amount: raw.to_string(),
            decimals: 6,
            block_number: block,
        }
    }

    #[tokio::test]
    async fn test_deposit_credits_linked_wallet_once() {
        let f = fixture();
        let user = UserId::new();
        f.linker.bind(WalletAddress::new("0xabc"), user.clone()).await;

        // $25 deposit, seen at depth 1
        f.rpc.push_event(deposit_event("0x1", 10, "0xabc", "25000000"));
        f.rpc.set_latest_block(10);
        f.observer.tick().await.unwrap();
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::zero());
        assert_eq!(f.deposits.count(DepositState::Seen).await, 1);

        // Depth reaches 5: confirmed and credited
        f.rpc.set_latest_block(14);
        assert_eq!(f.observer.tick().await.unwrap(), 1);
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::new(2500));
        assert_eq!(f.deposits.count(DepositState::Credited).await, 1);

        // Further ticks never credit again
        f.rpc.set_latest_block(20);
        assert_eq!(f.observer.tick().await.unwrap(), 0);
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::new(2500));
    }

    #[tokio::test]
    async fn test_reorged_deposit_never_credited() {
        let f = fixture();
        let user = UserId::new();
        f.linker.bind(WalletAddress::new("0xabc"), user.clone()).await;

        let event = deposit_event("0xdead", 10, "0xabc", "5000000");
        let event_id = event.event_id.clone();
        f.rpc.push_event(event);
        f.rpc.set_latest_block(11); // depth 2 of 5
        f.observer.tick().await.unwrap();
        assert_eq!(f.deposits.count(DepositState::Seen).await, 1);

        // A reorg replaces the block before depth 5
        f.rpc.remove_event(&event_id);
        f.rpc.set_latest_block(12);
        f.observer.tick().await.unwrap();
        assert_eq!(f.deposits.count(DepositState::Rejected).await, 1);
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::zero());

        // The canonical replacement confirms and credits exactly once
        f.rpc.push_event(deposit_event("0xbeef", 12, "0xabc", "5000000"));
        f.rpc.set_latest_block(16);
        assert_eq!(f.observer.tick().await.unwrap(), 1);
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::new(500));
    }

    #[tokio::test]
    async fn test_magic_amount_links_and_credits() {
        let f = fixture();
        let user = UserId::new();
        let request = f.linker.initiate(user.clone(), "USDC").await;

        f.rpc
            .push_event(deposit_event("0x2", 10, "0xnew", &request.magic_amount));
        f.rpc.set_latest_block(14);
        f.observer.tick().await.unwrap();

        // Wallet is now linked and the magic deposit itself credited
        assert_eq!(
            f.linker.owner_of(&WalletAddress::new("0xnew")).await,
            Some(user.clone())
        );
        assert!(f.ledger.balance(&user).await > CreditAmount::zero());
    }

    #[tokio::test]
    async fn test_unsupported_asset_rejected_without_credit() {
        let f = fixture();
        let user = UserId::new();
        f.linker.bind(WalletAddress::new("0xabc"), user.clone()).await;

        let mut event = deposit_event("0x3", 10, "0xabc", "1000000000000000000");
        event.asset = "PEPE".to_string();
        event.decimals = 18;
        f.rpc.push_event(event);
        f.rpc.set_latest_block(14);
        f.observer.tick().await.unwrap();

        assert_eq!(f.deposits.count(DepositState::Rejected).await, 1);
        assert_eq!(f.ledger.balance(&user).await, CreditAmount::zero());
    }

    #[tokio::test]
    async fn test_unknown_owner_waits_then_rejects() {
        let mut cfg = config();
        cfg.owner_timeout = chrono::Duration::zero();
        let rpc = Arc::new(FakeChainRpc::new(ChainId::new("base")));
        let deposits = DepositStore::new();
        let ledger = CreditLedger::new();
        let linker = WalletLinker::new(chrono::Duration::hours(1), 1_000_000);
        let oracle = Arc::new(FixedPriceOracle::new().with_price("USDC", dec!(1.0)));
        let (events, _) = broadcast::channel(64);
        let observer = ChainObserver::new(
            rpc.clone(),
            deposits.clone(),
            ledger,
            linker,
            oracle,
            events,
            cfg,
            1,
        );

        rpc.push_event(deposit_event("0x4", 10, "0xunknown", "1000000"));
        rpc.set_latest_block(14);
        observer.tick().await.unwrap();
        // Zero timeout: rejected on the first confirmed pass
        assert_eq!(deposits.count(DepositState::Rejected).await, 1);
    }

    #[test]
    fn test_deposit_usd_valuation() {
        let usd = deposit_usd_value("2500000", 6, dec!(1.0)).unwrap();
        assert_eq!(usd, UsdAmount::new(dec!(2.5)));
        let usd = deposit_usd_value("1000000000000000000", 18, dec!(3000)).unwrap();
        assert_eq!(usd, UsdAmount::new(dec!(3000)));
    }
}
