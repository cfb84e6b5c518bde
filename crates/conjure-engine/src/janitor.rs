//! The janitor - periodic self-healing of dangling state
//!
//! A crash between reserve and settlement leaves a held reservation behind.
//! The janitor resolves every dangling reserve against its generation's
//! stored state: completed generations commit, failed and cancelled ones
//! release, and reserves with no generation at all (the record never made
//! it to the store) release once they are old enough.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use conjure_ledger::CreditLedger;
use conjure_store::{GenerationStore, StoreError};
use conjure_types::GenerationStatus;

/// Janitor tuning
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    /// Reserves younger than this are left alone; their generation may
    /// still be settling normally.
    pub min_reserve_age: chrono::Duration,
    /// Reserves with no generation record are released after this long.
    pub orphan_cutoff: chrono::Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_reserve_age: chrono::Duration::minutes(5),
            orphan_cutoff: chrono::Duration::hours(1),
        }
    }
}

/// Periodic reconciliation worker
pub struct Janitor {
    ledger: CreditLedger,
    store: Arc<dyn GenerationStore>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(
        ledger: CreditLedger,
        store: Arc<dyn GenerationStore>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            config,
        }
    }

    /// One sweep. Returns how many reserves were resolved.
    pub async fn sweep(&self) -> usize {
        let dangling = self
            .ledger
            .dangling_reserves(self.config.min_reserve_age)
            .await;
        let mut resolved = 0;

        for reserve in dangling {
            let outcome = match self.store.get(&reserve.generation_id).await {
                Ok(record) => match record.status {
                    GenerationStatus::Completed => {
                        let charged = record.cost.charged.unwrap_or(reserve.amount);
                        self.ledger
                            .commit_charged(&reserve.generation_id, charged.min(reserve.amount))
                            .await
                            .map(|_| "committed")
                    }
                    GenerationStatus::Failed | GenerationStatus::Cancelled => self
                        .ledger
                        .release_with_reason(&reserve.generation_id, "janitor sweep")
                        .await
                        .map(|_| "released"),
                    // Still in flight: leave it for the engine.
                    GenerationStatus::Queued | GenerationStatus::Running => continue,
                },
                Err(StoreError::NotFound { .. }) => {
                    let age = chrono::Utc::now() - reserve.held_since;
                    if age < self.config.orphan_cutoff {
                        continue;
                    }
                    self.ledger
                        .release_with_reason(&reserve.generation_id, "orphaned reserve")
                        .await
                        .map(|_| "released orphan")
                }
                Err(err) => {
                    tracing::warn!(generation = %reserve.generation_id, error = %err, "janitor lookup failed");
                    continue;
                }
            };

            match outcome {
                Ok(action) => {
                    resolved += 1;
                    tracing::info!(
                        generation = %reserve.generation_id,
                        user = %reserve.user,
                        amount = reserve.amount.0,
                        action,
                        "janitor resolved dangling reserve"
                    );
                }
                Err(err) => {
                    tracing::warn!(generation = %reserve.generation_id, error = %err, "janitor settlement failed");
                }
            }
        }
        resolved
    }

    /// Sweep loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("janitor stopping");
                    return;
                }
            }
        }
    }
}
