//! End-to-end engine scenarios against scripted backends

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::broadcast;

use conjure_backends::{BackendRegistry, FakeBackend, FakeScript};
use conjure_engine::{
    CostAuthorization, EngineConfig, ExecutionEngine, ExecutionRequest, Janitor, JanitorConfig,
    Poller, PollerConfig, QueuePressure,
};
use conjure_ledger::CreditLedger;
use conjure_pricing::RateBook;
use conjure_registry::ToolRegistry;
use conjure_store::{GenerationStore, InMemoryGenerationStore};
use conjure_types::{
    BackendBinding, BackendId, ChainEventId, ChainId, CostModel, CreditAmount, CreditRate,
    DeliveryMode, FieldKind, GenerationStatus, InputField, NormalizedInputs, OrchestrationEvent,
    OutputPayload, ToolDefinition, ToolId, ToolTimeouts, UserId, Visibility,
};

fn tool(id: &str, mode: DeliveryMode, timeouts: ToolTimeouts) -> ToolDefinition {
    ToolDefinition {
        id: ToolId::from(id),
        display_name: id.to_string(),
        description: String::new(),
        command: None,
        category: None,
        inputs: vec![InputField::required("prompt", FieldKind::String)],
        outputs: vec![],
        delivery_mode: mode,
        cost_model: CostModel::Static { usd: dec!(0.10) },
        backend: BackendBinding {
            backend: BackendId::new("fake"),
            endpoint: id.to_string(),
        },
        visibility: Visibility::Public,
        timeouts,
        cost_tolerance: 0.1,
        allow_unknown_fields: false,
        allow_empty_output: false,
        platform_descriptions: HashMap::new(),
    }
}

struct Fixture {
    engine: Arc<ExecutionEngine>,
    backend: Arc<FakeBackend>,
    ledger: CreditLedger,
    store: InMemoryGenerationStore,
    events: broadcast::Receiver<OrchestrationEvent>,
    user: UserId,
}

async fn fixture(tools: Vec<ToolDefinition>, balance: u64) -> Fixture {
    let registry = Arc::new(ToolRegistry::with_definitions(tools).unwrap());
    let backend = Arc::new(FakeBackend::new("fake"));
    let mut backends = BackendRegistry::new();
    backends.register(backend.clone(), 4);

    let store = InMemoryGenerationStore::new();
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

    let (events_tx, events) = broadcast::channel(64);
    let engine = Arc::new(ExecutionEngine::new(
        registry,
        Arc::new(backends),
        Arc::new(store.clone()),
        ledger.clone(),
        Arc::new(RwLock::new(RateBook::new(CreditRate::new(dec!(100))))),
        events_tx,
        Arc::new(QueuePressure::new(1000)),
        EngineConfig::default(),
    ));

    Fixture {
        engine,
        backend,
        ledger,
        store,
        events,
        user,
    }
}

fn prompt_inputs() -> NormalizedInputs {
    let mut inputs = NormalizedInputs::new();
    inputs.insert("prompt", json!("a cat"));
    inputs
}

fn request(user: &UserId, tool: &str, quoted: u64) -> ExecutionRequest {
    ExecutionRequest::direct(
        user.clone(),
        ToolId::from(tool),
        prompt_inputs(),
        CreditAmount::new(quoted),
    )
}

#[tokio::test]
async fn immediate_tool_with_sufficient_credits() {
    let mut f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        100,
    )
    .await;
    f.backend.script_ok("t1", ("image", json!("https://cdn/1.png")));

    let outcome = f.engine.execute(request(&f.user, "t1", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Completed);
    assert!(outcome.outputs.is_some());

    // Charged exactly once, balance reflects the static cost
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));

    // Exactly one terminal event
    let event = f.events.recv().await.unwrap();
    assert!(matches!(
        event,
        OrchestrationEvent::GenerationCompleted { .. }
    ));
    assert!(f.events.try_recv().is_err());

    let record = f.store.get(&outcome.generation_id).await.unwrap();
    assert!(record.settled);
    assert_eq!(record.cost.charged, Some(CreditAmount::new(10)));
    assert!(record.outputs.is_some());
}

#[tokio::test]
async fn insufficient_credits_fails_without_charge() {
    let mut f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        5,
    )
    .await;
    f.backend.script_ok("t1", ("image", json!("x")));

    let outcome = f.engine.execute(request(&f.user, "t1", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Failed);
    assert_eq!(
        outcome.error.as_ref().unwrap().code,
        "INSUFFICIENT_CREDITS"
    );
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(5));

    // The backend was never invoked
    assert!(f.backend.submitted.lock().unwrap().is_empty());
    let event = f.events.recv().await.unwrap();
    assert!(matches!(event, OrchestrationEvent::GenerationFailed { .. }));
}

#[tokio::test]
async fn immediate_backend_error_releases_reserve() {
    let f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        100,
    )
    .await;
    f.backend
        .script("t1", FakeScript::Err("cuda out of memory".to_string()));

    let outcome = f.engine.execute(request(&f.user, "t1", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().code, "BACKEND_ERROR");
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(100));
}

#[tokio::test]
async fn webhook_duplicate_callbacks_settle_once() {
    let mut f = fixture(
        vec![tool("hook", DeliveryMode::Webhook, ToolTimeouts::default())],
        100,
    )
    .await;
    let mut outputs = OutputPayload::new();
    outputs.insert("image", json!("https://cdn/2.png"));
    f.backend.script(
        "hook",
        FakeScript::Job {
            polls_until_done: 0,
            outcome: Ok(outputs),
        },
    );

    let outcome = f.engine.execute(request(&f.user, "hook", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Running);

    let record = f.store.get(&outcome.generation_id).await.unwrap();
    let job_id = record.backend_job_id.clone().unwrap();

    // Webhook arrives three times; only the first settles
    for _ in 0..3 {
        let status = f.engine.handle_backend_callback(&job_id).await.unwrap();
        assert_eq!(status, GenerationStatus::Completed);
    }

    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));
    let event = f.events.recv().await.unwrap();
    assert!(matches!(
        event,
        OrchestrationEvent::GenerationCompleted { .. }
    ));
    assert!(f.events.try_recv().is_err());
}

#[tokio::test]
async fn poll_mode_completes_via_poller() {
    let f = fixture(
        vec![tool("slow", DeliveryMode::Poll, ToolTimeouts::default())],
        100,
    )
    .await;
    let mut outputs = OutputPayload::new();
    outputs.insert("video", json!("https://cdn/v.mp4"));
    f.backend.script(
        "slow",
        FakeScript::Job {
            polls_until_done: 1,
            outcome: Ok(outputs),
        },
    );

    let outcome = f.engine.execute(request(&f.user, "slow", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Running);

    let poller = Arc::new(Poller::new(
        f.engine.clone(),
        PollerConfig {
            tick: Duration::from_millis(5),
            base_interval: Duration::ZERO,
            jitter: 0.0,
        },
    ));
    for _ in 0..5 {
        poller.sweep().await;
    }

    let record = f.store.get(&outcome.generation_id).await.unwrap();
    assert_eq!(record.status, GenerationStatus::Completed);
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));
}

#[tokio::test]
async fn stuck_poll_job_times_out_at_hard_deadline() {
    let f = fixture(
        vec![tool(
            "stuck",
            DeliveryMode::Poll,
            ToolTimeouts {
                soft_ms: 10,
                hard_ms: 0,
            },
        )],
        100,
    )
    .await;
    f.backend.script("stuck", FakeScript::Stuck);

    let outcome = f.engine.execute(request(&f.user, "stuck", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Running);

    let poller = Arc::new(Poller::new(f.engine.clone(), PollerConfig::default()));
    poller.sweep().await;

    let record = f.store.get(&outcome.generation_id).await.unwrap();
    assert_eq!(record.status, GenerationStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap().code, "BACKEND_TIMEOUT");
    // Reserve released at the deadline, not kept
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(100));
}

#[tokio::test]
async fn cancel_running_generation_releases_and_forwards() {
    let f = fixture(
        vec![tool("hook", DeliveryMode::Webhook, ToolTimeouts::default())],
        100,
    )
    .await;
    f.backend.script(
        "hook",
        FakeScript::Job {
            polls_until_done: 99,
            outcome: Ok(OutputPayload::new()),
        },
    );

    let outcome = f.engine.execute(request(&f.user, "hook", 10)).await.unwrap();
    let status = f.engine.cancel(&outcome.generation_id).await.unwrap();
    assert_eq!(status, GenerationStatus::Cancelled);
    assert_eq!(f.backend.cancel_count(), 1);
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(100));

    // Cancel after terminal is a no-op
    let again = f.engine.cancel(&outcome.generation_id).await.unwrap();
    assert_eq!(again, GenerationStatus::Cancelled);
    assert_eq!(f.backend.cancel_count(), 1);
}

#[tokio::test]
async fn empty_output_fails_unless_tool_opts_in() {
    let mut lax = tool("lax", DeliveryMode::Immediate, ToolTimeouts::default());
    lax.allow_empty_output = true;
    let strict = tool("strict", DeliveryMode::Immediate, ToolTimeouts::default());

    let f = fixture(vec![lax, strict], 100).await;
    f.backend.script("lax", FakeScript::Ok(OutputPayload::new()));
    f.backend
        .script("strict", FakeScript::Ok(OutputPayload::new()));

    let outcome = f.engine.execute(request(&f.user, "strict", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().code, "BACKEND_ERROR");

    let outcome = f.engine.execute(request(&f.user, "lax", 10)).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Completed);
}

#[tokio::test]
async fn one_shot_payment_bypasses_ledger() {
    let f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        0,
    )
    .await;
    f.backend.script_ok("t1", ("image", json!("x")));

    let mut req = request(&f.user, "t1", 10);
    req.authorization = CostAuthorization::OneShot;
    let outcome = f.engine.execute(req).await.unwrap();
    assert_eq!(outcome.status, GenerationStatus::Completed);
    // No ledger movement for an externally paid generation
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::zero());
}

#[tokio::test]
async fn replayed_request_yields_one_record() {
    let f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        100,
    )
    .await;
    f.backend.script_ok("t1", ("image", json!("x")));

    let mut req = request(&f.user, "t1", 10);
    req.generation_id = Some(conjure_types::GenerationId::new());

    let first = f.engine.execute(req.clone()).await.unwrap();
    let second = f.engine.execute(req).await.unwrap();

    assert_eq!(first.generation_id, second.generation_id);
    assert_eq!(second.status, GenerationStatus::Completed);
    assert_eq!(f.store.len().await, 1);
    // Charged once, not twice
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));
}

#[tokio::test]
async fn admission_control_refuses_with_retry_after() {
    let registry = Arc::new(
        ToolRegistry::with_definitions(vec![tool(
            "t1",
            DeliveryMode::Immediate,
            ToolTimeouts::default(),
        )])
        .unwrap(),
    );
    let backend = Arc::new(FakeBackend::new("fake"));
    backend.script_ok("t1", ("image", json!("x")));
    let mut backends = BackendRegistry::new();
    backends.register(backend, 4);

    let pressure = Arc::new(QueuePressure::new(0));
    pressure.incr();

    let (events_tx, _events) = broadcast::channel(16);
    let engine = ExecutionEngine::new(
        registry,
        Arc::new(backends),
        Arc::new(InMemoryGenerationStore::new()),
        CreditLedger::new(),
        Arc::new(RwLock::new(RateBook::new(CreditRate::new(dec!(100))))),
        events_tx,
        pressure,
        EngineConfig::default(),
    );

    let err = engine
        .execute(request(&UserId::new(), "t1", 10))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "RATE_LIMITED");
}

#[tokio::test]
async fn janitor_resolves_dangling_reserves() {
    let f = fixture(
        vec![tool("t1", DeliveryMode::Immediate, ToolTimeouts::default())],
        100,
    )
    .await;
    f.backend.script_ok("t1", ("image", json!("x")));

    // Simulate a crash: reserve exists, generation record says completed,
    // but the commit never happened.
    let outcome = f.engine.execute(request(&f.user, "t1", 10)).await.unwrap();
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));

    // A second orphaned reserve with no record behind it
    let orphan = conjure_types::GenerationId::new();
    f.ledger
        .reserve(&f.user, CreditAmount::new(20), &orphan)
        .await
        .unwrap();
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(70));

    let janitor = Janitor::new(
        f.ledger.clone(),
        Arc::new(f.store.clone()),
        JanitorConfig {
            interval: Duration::from_secs(3600),
            min_reserve_age: chrono::Duration::zero(),
            orphan_cutoff: chrono::Duration::zero(),
        },
    );
    janitor.sweep().await;

    // Orphan released; the settled generation stays settled
    assert_eq!(f.ledger.balance(&f.user).await, CreditAmount::new(90));
    let _ = outcome;
}
