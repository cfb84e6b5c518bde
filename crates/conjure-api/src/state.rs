//! Shared application state - the dependency bundle
//!
//! Everything the handlers need, built once in the server binary and
//! passed through axum state. No globals; the registry is the one
//! process-wide swap point and it lives here as an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use conjure_auth::{ApiKeyService, SessionService, SlidingWindowLimiter};
use conjure_chain::WalletLinker;
use conjure_dispatch::{Dispatcher, ResponseSlots};
use conjure_engine::{ExecutionEngine, QueuePressure};
use conjure_ledger::CreditLedger;
use conjure_payments::PaymentGate;
use conjure_pricing::RateBook;
use conjure_registry::{CatalogSource, ToolRegistry};
use conjure_spells::SpellRunner;
use conjure_store::{CastStore, GenerationStore};

/// Front-door configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Production mode rejects loopback webhook URLs
    pub production: bool,
    /// How long synchronous immediate responses may block
    pub immediate_wait: Duration,
    /// Polling hint returned with 202 responses
    pub check_after_ms: u64,
    /// Shared secret backends present on inbound callbacks
    pub backend_callback_secret: String,
    /// Bearer token for the admin surface
    pub admin_token: String,
    /// Address users deposit to (shown in wallet-linking responses)
    pub deposit_address: String,
    /// Asset used for wallet linking deposits
    pub link_asset: String,
}

/// The dependency bundle handlers read from
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub runner: Arc<SpellRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ToolRegistry>,
    pub catalog_sources: Vec<Arc<dyn CatalogSource>>,
    pub ledger: CreditLedger,
    pub generations: Arc<dyn GenerationStore>,
    pub casts: Arc<dyn CastStore>,
    pub rates: Arc<RwLock<RateBook>>,
    pub gate: Arc<PaymentGate>,
    pub slots: Arc<ResponseSlots>,
    pub linker: WalletLinker,
    pub api_keys: ApiKeyService,
    pub sessions: SessionService,
    pub limiter: SlidingWindowLimiter,
    pub pressure: Arc<QueuePressure>,
    pub config: ApiConfig,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
