//! Front-door integration tests: full state wired with scripted backends

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::RwLock;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;

use conjure_api::{create_router, ApiConfig, AppState};
use conjure_auth::{ApiKeyService, RateLimitConfig, SessionService, SlidingWindowLimiter};
use conjure_backends::{BackendRegistry, FakeBackend, RetryPolicy};
use conjure_chain::WalletLinker;
use conjure_dispatch::{Dispatcher, DispatcherConfig, ResponseSlots, WebhookDeliverer};
use conjure_engine::{EngineConfig, ExecutionEngine, QueuePressure};
use conjure_ledger::CreditLedger;
use conjure_payments::{FakeVerifier, GateConfig, PaymentGate};
use conjure_pricing::RateBook;
use conjure_registry::ToolRegistry;
use conjure_spells::{FieldMigrations, SpellBook, SpellRunner};
use conjure_store::{InMemoryCastStore, InMemoryGenerationStore};
use conjure_types::{
    BackendBinding, BackendId, ChainEventId, ChainId, CostModel, CreditAmount, CreditRate,
    DeliveryMode, FieldKind, InputField, ToolDefinition, ToolId, ToolTimeouts, UserId, Visibility,
};

fn tool(id: &str, mode: DeliveryMode) -> ToolDefinition {
    ToolDefinition {
        id: ToolId::from(id),
        display_name: id.to_string(),
        description: "a tool".to_string(),
        command: None,
        category: Some("image".to_string()),
        inputs: vec![InputField::required("prompt", FieldKind::String)],
        outputs: vec![],
        delivery_mode: mode,
        cost_model: CostModel::Static { usd: dec!(0.10) },
        backend: BackendBinding {
            backend: BackendId::new("fake"),
            endpoint: id.to_string(),
        },
        visibility: Visibility::Public,
        timeouts: ToolTimeouts::default(),
        cost_tolerance: 0.1,
        allow_unknown_fields: false,
        allow_empty_output: false,
        platform_descriptions: HashMap::new(),
    }
}

struct Fixture {
    router: Router,
    ledger: CreditLedger,
    user: UserId,
    api_key: String,
    generations: InMemoryGenerationStore,
    api_keys: ApiKeyService,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

async fn fixture(balance: u64) -> Fixture {
    let registry = Arc::new(
        ToolRegistry::with_definitions(vec![
            tool("echo", DeliveryMode::Immediate),
            tool("hook", DeliveryMode::Webhook),
        ])
        .unwrap(),
    );
    let backend = Arc::new(FakeBackend::new("fake"));
    backend.script_ok("echo", ("image", json!("https://cdn/out.png")));
    let mut backends = BackendRegistry::new();
    backends.register(backend, 4);

    let generations = InMemoryGenerationStore::new();
    let casts = InMemoryCastStore::new();
    let ledger = CreditLedger::new();
    let user = UserId::new();
    if balance > 0 {
        ledger
            .credit(
                &ChainEventId::new(ChainId::new("base"), "0xseed", 0),
                &user,
                CreditAmount::new(balance),
            )
            .await
            .unwrap();
    }

    let rates = Arc::new(RwLock::new(RateBook::new(CreditRate::new(dec!(100)))));
    let (events_tx, _) = broadcast::channel(256);
    let pressure = Arc::new(QueuePressure::new(100));

    let engine = Arc::new(ExecutionEngine::new(
        registry.clone(),
        Arc::new(backends),
        Arc::new(generations.clone()),
        ledger.clone(),
        rates.clone(),
        events_tx.clone(),
        pressure.clone(),
        EngineConfig::default(),
    ));

    let runner = Arc::new(SpellRunner::new(
        Arc::new(SpellBook::new()),
        registry.clone(),
        engine.clone(),
        Arc::new(casts.clone()),
        Arc::new(generations.clone()),
        rates.clone(),
        FieldMigrations::new(),
    ));

    let slots = Arc::new(ResponseSlots::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(generations.clone()),
        Arc::new(casts.clone()),
        runner.clone(),
        Vec::new(),
        WebhookDeliverer::new(RetryPolicy::none()),
        slots.clone(),
        rates.clone(),
        pressure.clone(),
        DispatcherConfig::default(),
    ));
    // Run the dispatcher the way the server does
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(
        dispatcher
            .clone()
            .run(events_tx.subscribe(), shutdown_rx),
    );

    let verifier = FakeVerifier::new();
    verifier.accept("payment-good", "sig-good");
    let gate = Arc::new(PaymentGate::new(
        Arc::new(verifier),
        GateConfig {
            receiver: "0xreceiver".to_string(),
            asset: "USDC".to_string(),
            chain: "base".to_string(),
            atomic_per_usd: 1_000_000,
        },
    ));

    let api_keys = ApiKeyService::new();
    let (api_key, _) = api_keys.issue(user.clone(), "test").await;

    let state = Arc::new(AppState {
        engine,
        runner,
        dispatcher,
        registry,
        catalog_sources: Vec::new(),
        ledger: ledger.clone(),
        generations: Arc::new(generations.clone()),
        casts: Arc::new(casts),
        rates,
        gate,
        slots,
        linker: WalletLinker::new(chrono::Duration::minutes(30), 1_000_000),
        api_keys: api_keys.clone(),
        sessions: SessionService::new(chrono::Duration::hours(1)),
        limiter: SlidingWindowLimiter::new(RateLimitConfig::default()),
        pressure,
        config: ApiConfig {
            production: false,
            immediate_wait: Duration::from_secs(2),
            check_after_ms: 2_000,
            backend_callback_secret: "cb-secret".to_string(),
            admin_token: "admin-token".to_string(),
            deposit_address: "0xdeposit".to_string(),
            link_asset: "USDC".to_string(),
        },
        started_at: chrono::Utc::now(),
    });

    Fixture {
        router: create_router(state),
        ledger,
        user,
        api_key,
        generations,
        api_keys,
        _shutdown: shutdown_tx,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post(path: &str, api_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn execute_immediate_returns_outputs_and_charges() {
    let f = fixture(100).await;
    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({"tool_id": "echo", "inputs": {"prompt": "a cat"}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert!(body["generation_id"].as_str().unwrap().starts_with("gen_"));
    assert_eq!(body["outputs"]["image"], json!("https://cdn/out.png"));
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));
}

#[tokio::test]
async fn insufficient_credits_maps_to_402_envelope() {
    let f = fixture(5).await;
    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({"tool_id": "echo", "inputs": {"prompt": "a cat"}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDITS");
    assert!(body["error"]["request_id"].is_string());
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(5));
}

#[tokio::test]
async fn unknown_tool_is_404_and_bad_inputs_400() {
    let f = fixture(100).await;

    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({"tool_id": "nope", "inputs": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({"tool_id": "echo", "inputs": {"prompt": "x", "seed": 1}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn missing_credentials_is_401() {
    let f = fixture(100).await;
    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            None,
            json!({"tool_id": "echo", "inputs": {"prompt": "x"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn generation_status_round_trip_and_foreign_records_hidden() {
    let f = fixture(100).await;
    let (_, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({"tool_id": "echo", "inputs": {"prompt": "x"}}),
        ),
    )
    .await;
    let generation_id = body["generation_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/generations/{}", generation_id))
        .header("x-api-key", &f.api_key)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["cost"]["charged_credits"], 10);

    // Another user's key reads it as not-found
    let (other_key, _) = f.api_keys.issue(UserId::new(), "other").await;
    let request = Request::builder()
        .uri(format!("/generations/{}", generation_id))
        .header("x-api-key", &other_key)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn x402_without_payment_gets_requirements_then_replay_is_refused() {
    let f = fixture(0).await;

    // No payment: 402 with requirements
    let (status, body) = send(
        &f.router,
        post(
            "/x402/execute",
            None,
            json!({"tool_id": "echo", "inputs": {"prompt": "x"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "PAYMENT_REQUIRED");
    assert_eq!(body["payment_requirements"]["receiver"], "0xreceiver");

    // Paid: executes and returns outputs
    let (status, body) = send(
        &f.router,
        post(
            "/x402/execute",
            None,
            json!({
                "tool_id": "echo",
                "inputs": {"prompt": "x"},
                "payment": "payment-good",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    let first_count = f.generations.len().await;

    // Replay: refused, no new generation
    let (status, body) = send(
        &f.router,
        post(
            "/x402/execute",
            None,
            json!({
                "tool_id": "echo",
                "inputs": {"prompt": "x"},
                "payment": "payment-good",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "PAYMENT_ALREADY_USED");
    assert_eq!(f.generations.len().await, first_count);
}

#[tokio::test]
async fn health_reports_catalog_and_queue() {
    let f = fixture(0).await;
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["catalog_version"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn tools_discovery_is_public() {
    let f = fixture(0).await;
    let request = Request::builder().uri("/tools").body(Body::empty()).unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tools"].as_array().unwrap().len(), 2);

    let request = Request::builder()
        .uri("/tools/echo")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "echo");
}

#[tokio::test]
async fn webhook_delivery_requires_valid_url() {
    let f = fixture(100).await;
    let (status, body) = send(
        &f.router,
        post(
            "/generations/execute",
            Some(&f.api_key),
            json!({
                "tool_id": "hook",
                "inputs": {"prompt": "x"},
                "delivery": {"mode": "webhook", "url": "ftp://example.com"},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn wallet_link_flow_returns_magic_amount() {
    let f = fixture(0).await;
    let (status, body) = send(
        &f.router,
        post("/wallets/link/initiate", Some(&f.api_key), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deposit_address"], "0xdeposit");
    let link_id = body["request_id"].as_str().unwrap().to_string();
    assert!(body["magic_amount"].as_str().unwrap().parse::<u64>().unwrap() > 1_000_000);

    let request = Request::builder()
        .uri(format!("/wallets/link/status/{}", link_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&f.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
}
