//! Conjure Server
//!
//! The orchestration service binary: wires the dependency bundle, spawns
//! the background workers, and serves the REST front door.
//!
//! ```bash
//! # Start with environment configuration (.env is honored)
//! conjure-server
//!
//! # Development mode with relaxed validation
//! conjure-server --dev
//! ```

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conjure_api::{create_router, ApiConfig, AppState};
use conjure_auth::{ApiKeyService, RateLimitConfig, SessionService, SlidingWindowLimiter};
use conjure_backends::{
    BackendRegistry, LlmHttpBackend, RetryPolicy, ToolBackend, WorkflowHttpBackend,
};
use conjure_chain::{
    ChainObserver, DepositStore, FixedPriceOracle, HttpChainRpc, HttpPriceOracle, ObserverConfig,
    PriceOracle, WalletLinker,
};
use conjure_dispatch::{Dispatcher, DispatcherConfig, ResponseSlots, WebhookDeliverer};
use conjure_engine::{
    EngineConfig, ExecutionEngine, Janitor, JanitorConfig, Poller, PollerConfig, QueuePressure,
};
use conjure_ledger::CreditLedger;
use conjure_payments::{GateConfig, HttpFacilitator, PaymentGate};
use conjure_pricing::RateBook;
use conjure_registry::{
    CatalogSource, RemoteCatalogSource, StaticCatalogSource, ToolRegistry,
};
use conjure_spells::{FieldMigrations, SpellBook, SpellRunner};
use conjure_store::{InMemoryCastStore, InMemoryGenerationStore};
use conjure_types::{ChainId, CreditRate};

use crate::config::{BackendKind, ServerConfig};

/// Conjure orchestration server
#[derive(Parser, Debug)]
#[command(name = "conjure-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, env = "CONJURE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "CONJURE_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONJURE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json, pretty)
    #[arg(long, env = "CONJURE_LOG_FORMAT", default_value = "pretty")]
    log_format: String,

    /// Development mode (relaxed validation, fixed prices)
    #[arg(long, env = "CONJURE_DEV_MODE")]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, &args.log_format)?;

    let mut cfg = ServerConfig::from_env()?;
    if let Some(host) = args.host.clone() {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    cfg.validate(args.dev)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        chains = cfg.chains.len(),
        backends = cfg.backends.len(),
        "starting conjure server"
    );

    // ------------------------------------------------------------------
    // Shared services
    // ------------------------------------------------------------------
    let ledger = CreditLedger::new();
    let generations = Arc::new(InMemoryGenerationStore::new());
    let casts = Arc::new(InMemoryCastStore::new());
    let deposits = DepositStore::new();
    let linker = WalletLinker::new(
        chrono::Duration::minutes(cfg.link_ttl_minutes),
        cfg.payment_atomic_per_usd,
    );

    let mut rates = RateBook::new(CreditRate::new(cfg.credits_per_usd));
    for (class, rate) in &cfg.gpu_second_rates {
        rates = rates.with_gpu_rate(class.clone(), *rate);
    }
    let rates = Arc::new(RwLock::new(rates));

    // Tool catalog: static file plus the remote workflow catalog
    let mut catalog_sources: Vec<Arc<dyn CatalogSource>> = Vec::new();
    if let Some(path) = &cfg.catalog_path {
        let json = std::fs::read_to_string(path)?;
        catalog_sources.push(Arc::new(StaticCatalogSource::from_json(&json)?));
    }
    if let Some(url) = &cfg.catalog_url {
        catalog_sources.push(Arc::new(RemoteCatalogSource::new(
            url.clone(),
            cfg.catalog_api_key.clone(),
        )));
    }
    let registry = Arc::new(ToolRegistry::empty());
    match registry.reload(&catalog_sources).await {
        Ok(count) => tracing::info!(tools = count, "tool catalog loaded"),
        Err(err) => tracing::warn!(error = %err, "starting with an empty tool catalog"),
    }

    // Backends
    let mut backend_registry = BackendRegistry::new();
    for spec in &cfg.backends {
        let backend: Arc<dyn ToolBackend> = match spec.kind {
            BackendKind::Workflow => Arc::new(WorkflowHttpBackend::new(
                conjure_types::BackendId::new(spec.id.clone()),
                spec.base_url.clone(),
                spec.api_key.clone(),
                RetryPolicy::default(),
            )),
            BackendKind::Llm => Arc::new(LlmHttpBackend::new(
                conjure_types::BackendId::new(spec.id.clone()),
                spec.base_url.clone(),
                spec.api_key.clone(),
            )),
        };
        backend_registry.register(backend, spec.max_concurrency);
    }
    let backend_registry = Arc::new(backend_registry);

    // ------------------------------------------------------------------
    // Orchestration core
    // ------------------------------------------------------------------
    let (events_tx, _) = broadcast::channel(1024);
    let pressure = Arc::new(QueuePressure::new(cfg.dispatch_high_water));

    let engine = Arc::new(ExecutionEngine::new(
        registry.clone(),
        backend_registry,
        generations.clone(),
        ledger.clone(),
        rates.clone(),
        events_tx.clone(),
        pressure.clone(),
        EngineConfig {
            callback_base_url: cfg.callback_base_url.clone(),
            retry_after_ms: 2_000,
            runtime_ewma_alpha: 0.2,
        },
    ));

    let book = Arc::new(SpellBook::new());
    let runner = Arc::new(SpellRunner::new(
        book,
        registry.clone(),
        engine.clone(),
        casts.clone(),
        generations.clone(),
        rates.clone(),
        FieldMigrations::new(),
    ));

    let slots = Arc::new(ResponseSlots::new());
    let dispatcher = Arc::new(Dispatcher::new(
        generations.clone(),
        casts.clone(),
        runner.clone(),
        Vec::new(),
        WebhookDeliverer::new(RetryPolicy {
            max_attempts: cfg.delivery_retry_attempts.max(1),
            base_delay: cfg.delivery_retry_base,
            max_delay: cfg.delivery_retry_base * 16,
            jitter: 0.2,
        }),
        slots.clone(),
        rates.clone(),
        pressure.clone(),
        DispatcherConfig {
            workers: cfg.dispatch_workers,
            queue_capacity: cfg.dispatch_queue_capacity,
        },
    ));

    let gate = Arc::new(PaymentGate::new(
        Arc::new(HttpFacilitator::new(cfg.facilitator_url.clone())),
        GateConfig {
            receiver: cfg.payment_receiver.clone(),
            asset: cfg.payment_asset.clone(),
            chain: cfg.payment_chain.clone(),
            atomic_per_usd: cfg.payment_atomic_per_usd,
        },
    ));

    // ------------------------------------------------------------------
    // Background workers
    // ------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    workers.push(tokio::spawn(
        dispatcher
            .clone()
            .run(events_tx.subscribe(), shutdown_rx.clone()),
    ));

    let poller = Arc::new(Poller::new(
        engine.clone(),
        PollerConfig {
            tick: cfg.poll_tick,
            ..PollerConfig::default()
        },
    ));
    workers.push(tokio::spawn(poller.run(shutdown_rx.clone())));

    let janitor = Arc::new(Janitor::new(
        ledger.clone(),
        generations.clone(),
        JanitorConfig {
            interval: cfg.janitor_interval,
            ..JanitorConfig::default()
        },
    ));
    workers.push(tokio::spawn(janitor.run(shutdown_rx.clone())));

    // One observer per configured chain
    let price_oracle: Arc<dyn PriceOracle> = if args.dev {
        let oracle = FixedPriceOracle::new();
        for asset in &cfg.supported_assets {
            oracle.set_price(asset.clone(), rust_decimal::Decimal::ONE);
        }
        Arc::new(oracle)
    } else {
        Arc::new(HttpPriceOracle::new(cfg.price_oracle_url.clone()))
    };
    for chain in &cfg.chains {
        let rpc = Arc::new(HttpChainRpc::new(
            ChainId::new(chain.name.clone()),
            chain.rpc_url.clone(),
            chain.contract_address.clone(),
            chain.deposit_topic.clone(),
            chain.asset.clone(),
            chain.decimals,
        ));
        let observer = Arc::new(ChainObserver::new(
            rpc,
            deposits.clone(),
            ledger.clone(),
            linker.clone(),
            price_oracle.clone(),
            events_tx.clone(),
            ObserverConfig {
                confirmation_depth: chain.confirmation_depth,
                supported_assets: cfg.supported_assets.clone(),
                credit_rate: CreditRate::new(cfg.credits_per_usd),
                owner_timeout: chrono::Duration::hours(24),
                poll_interval: cfg.observer_interval,
                max_backoff: cfg.observer_interval * 16,
            },
            chain.start_block,
        ));
        workers.push(tokio::spawn(observer.run(shutdown_rx.clone())));
    }

    // Expiry sweeps for link requests, sessions, and limiter buckets
    let sessions = SessionService::new(chrono::Duration::hours(cfg.session_ttl_hours));
    let limiter = SlidingWindowLimiter::new(RateLimitConfig {
        enabled: true,
        max_requests: cfg.rate_limit_requests,
        window: cfg.rate_limit_window,
    });
    {
        let linker = linker.clone();
        let sessions = sessions.clone();
        let limiter = limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                        linker.expire_stale().await;
                        sessions.expire_stale().await;
                        limiter.expire_stale().await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    // ------------------------------------------------------------------
    // HTTP surface
    // ------------------------------------------------------------------
    let state = Arc::new(AppState {
        engine,
        runner,
        dispatcher,
        registry,
        catalog_sources,
        ledger,
        generations,
        casts,
        rates,
        gate,
        slots,
        linker,
        api_keys: ApiKeyService::new(),
        sessions,
        limiter,
        pressure,
        config: ApiConfig {
            production: cfg.production,
            immediate_wait: cfg.immediate_wait,
            check_after_ms: cfg.check_after_ms,
            backend_callback_secret: cfg.backend_callback_secret.clone(),
            admin_token: cfg.admin_token.clone(),
            deposit_address: cfg.deposit_address.clone(),
            link_asset: cfg.payment_asset.clone(),
        },
        started_at: chrono::Utc::now(),
    });

    let router = create_router(state);
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the workers and wait for them to drain
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,tower_http=warn")));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        "json" => registry.with(fmt::layer().json()).init(),
        _ => registry.with(fmt::layer()).init(),
    }
    Ok(())
}
