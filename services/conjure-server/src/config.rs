//! Server configuration
//!
//! Everything comes from the environment (a `.env` file in development),
//! with CLI flags overriding the basics. Chains and backends are declared
//! as comma-separated specs so a deployment is one env block.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context};
use rust_decimal::Decimal;

/// One watched chain:
/// `CONJURE_CHAINS="base|https://rpc.base.org|0xledger|0xdeposit_topic|USDC|6|5|0"`
/// (name|rpc|contract|topic|asset|decimals|confirmations|start_block)
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub name: String,
    pub rpc_url: String,
    pub contract_address: String,
    pub deposit_topic: String,
    pub asset: String,
    pub decimals: u32,
    pub confirmation_depth: u64,
    pub start_block: u64,
}

/// One upstream backend:
/// `CONJURE_BACKENDS="comfy|workflow|https://comfy.internal|key123|4,llm|llm|https://llm.internal||8"`
/// (id|kind|base_url|api_key|max_concurrency)
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub id: String,
    pub kind: BackendKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Workflow,
    Llm,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub production: bool,

    pub chains: Vec<ChainSpec>,
    pub backends: Vec<BackendSpec>,

    /// Credits minted per USD
    pub credits_per_usd: Decimal,
    /// `class=usd_per_second` pairs, comma separated
    pub gpu_second_rates: Vec<(String, Decimal)>,
    pub supported_assets: HashSet<String>,

    pub catalog_path: Option<String>,
    pub catalog_url: Option<String>,
    pub catalog_api_key: Option<String>,

    pub facilitator_url: String,
    pub price_oracle_url: String,
    pub payment_receiver: String,
    pub payment_asset: String,
    pub payment_chain: String,
    pub payment_atomic_per_usd: u64,

    pub callback_base_url: String,
    pub backend_callback_secret: String,
    pub admin_token: String,
    pub deposit_address: String,

    pub delivery_retry_attempts: u32,
    pub delivery_retry_base: Duration,
    pub dispatch_workers: usize,
    pub dispatch_queue_capacity: usize,
    pub dispatch_high_water: usize,

    pub poll_tick: Duration,
    pub janitor_interval: Duration,
    pub observer_interval: Duration,
    pub immediate_wait: Duration,
    pub check_after_ms: u64,

    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub session_ttl_hours: i64,
    pub link_ttl_minutes: i64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Assemble configuration from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let chains = parse_chains(&env_or("CONJURE_CHAINS", ""))?;
        let backends = parse_backends(&env_or("CONJURE_BACKENDS", ""))?;

        let gpu_second_rates = env_or("CONJURE_GPU_RATES", "a100=0.002")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (class, rate) = pair
                    .split_once('=')
                    .with_context(|| format!("bad GPU rate '{}'", pair))?;
                let rate: Decimal = rate
                    .parse()
                    .with_context(|| format!("bad GPU rate value '{}'", rate))?;
                Ok((class.to_string(), rate))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let supported_assets = env_or("CONJURE_SUPPORTED_ASSETS", "USDC,ETH")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            host: env_or("CONJURE_HOST", "0.0.0.0"),
            port: env_parse("CONJURE_PORT", 8080),
            production: env_parse("CONJURE_PRODUCTION", false),

            chains,
            backends,

            credits_per_usd: env_or("CONJURE_CREDITS_PER_USD", "100")
                .parse()
                .context("bad CONJURE_CREDITS_PER_USD")?,
            gpu_second_rates,
            supported_assets,

            catalog_path: env_opt("CONJURE_CATALOG_PATH"),
            catalog_url: env_opt("CONJURE_CATALOG_URL"),
            catalog_api_key: env_opt("CONJURE_CATALOG_API_KEY"),

            facilitator_url: env_or("CONJURE_FACILITATOR_URL", "http://localhost:9402"),
            price_oracle_url: env_or("CONJURE_PRICE_ORACLE_URL", "http://localhost:9403"),
            payment_receiver: env_or("CONJURE_PAYMENT_RECEIVER", ""),
            payment_asset: env_or("CONJURE_PAYMENT_ASSET", "USDC"),
            payment_chain: env_or("CONJURE_PAYMENT_CHAIN", "base"),
            payment_atomic_per_usd: env_parse("CONJURE_PAYMENT_ATOMIC_PER_USD", 1_000_000),

            callback_base_url: env_or(
                "CONJURE_CALLBACK_BASE_URL",
                "http://localhost:8080/callbacks/backend",
            ),
            backend_callback_secret: env_or("CONJURE_CALLBACK_SECRET", ""),
            admin_token: env_or("CONJURE_ADMIN_TOKEN", ""),
            deposit_address: env_or("CONJURE_DEPOSIT_ADDRESS", ""),

            delivery_retry_attempts: env_parse("CONJURE_DELIVERY_RETRIES", 5),
            delivery_retry_base: Duration::from_millis(env_parse(
                "CONJURE_DELIVERY_RETRY_BASE_MS",
                500,
            )),
            dispatch_workers: env_parse("CONJURE_DISPATCH_WORKERS", 4),
            dispatch_queue_capacity: env_parse("CONJURE_DISPATCH_QUEUE", 256),
            dispatch_high_water: env_parse("CONJURE_DISPATCH_HIGH_WATER", 200),

            poll_tick: Duration::from_millis(env_parse("CONJURE_POLL_TICK_MS", 500)),
            janitor_interval: Duration::from_secs(env_parse("CONJURE_JANITOR_INTERVAL_S", 60)),
            observer_interval: Duration::from_secs(env_parse("CONJURE_OBSERVER_INTERVAL_S", 10)),
            immediate_wait: Duration::from_millis(env_parse("CONJURE_IMMEDIATE_WAIT_MS", 30_000)),
            check_after_ms: env_parse("CONJURE_CHECK_AFTER_MS", 2_000),

            rate_limit_requests: env_parse("CONJURE_RATE_LIMIT", 60),
            rate_limit_window: Duration::from_secs(env_parse("CONJURE_RATE_WINDOW_S", 60)),
            session_ttl_hours: env_parse("CONJURE_SESSION_TTL_HOURS", 24),
            link_ttl_minutes: env_parse("CONJURE_LINK_TTL_MINUTES", 30),
        })
    }

    /// Refuse configurations that cannot work.
    pub fn validate(&self, dev_mode: bool) -> anyhow::Result<()> {
        if self.backends.is_empty() {
            bail!("no backends configured (CONJURE_BACKENDS)");
        }
        if !dev_mode && self.production {
            if self.backend_callback_secret.is_empty() {
                bail!("CONJURE_CALLBACK_SECRET is required in production");
            }
            if self.admin_token.is_empty() {
                bail!("CONJURE_ADMIN_TOKEN is required in production");
            }
            if self.payment_receiver.is_empty() {
                bail!("CONJURE_PAYMENT_RECEIVER is required in production");
            }
        }
        Ok(())
    }
}

fn parse_chains(raw: &str) -> anyhow::Result<Vec<ChainSpec>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|spec| {
            let parts: Vec<&str> = spec.split('|').collect();
            if parts.len() != 8 {
                bail!("chain spec '{}' must have 8 fields", spec);
            }
            Ok(ChainSpec {
                name: parts[0].to_string(),
                rpc_url: parts[1].to_string(),
                contract_address: parts[2].to_string(),
                deposit_topic: parts[3].to_string(),
                asset: parts[4].to_string(),
                decimals: parts[5].parse().context("chain decimals")?,
                confirmation_depth: parts[6].parse().context("chain confirmations")?,
                start_block: parts[7].parse().context("chain start block")?,
            })
        })
        .collect()
}

fn parse_backends(raw: &str) -> anyhow::Result<Vec<BackendSpec>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|spec| {
            let parts: Vec<&str> = spec.split('|').collect();
            if parts.len() != 5 {
                bail!("backend spec '{}' must have 5 fields", spec);
            }
            let kind = match parts[1] {
                "workflow" => BackendKind::Workflow,
                "llm" => BackendKind::Llm,
                other => bail!("unknown backend kind '{}'", other),
            };
            Ok(BackendSpec {
                id: parts[0].to_string(),
                kind,
                base_url: parts[2].to_string(),
                api_key: if parts[3].is_empty() {
                    None
                } else {
                    Some(parts[3].to_string())
                },
                max_concurrency: parts[4].parse().context("backend concurrency")?,
            })
        })
        .collect()
}
