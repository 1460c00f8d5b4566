mod common;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use duratask::runtime::registry::ActivityRegistry;
use duratask::runtime::{self};
use duratask::{Client, ErrorKind, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QuoteRequest {
    symbol: String,
    quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    total_cents: u64,
}

#[tokio::test]
async fn typed_payloads_flow_end_to_end() {
    let store = common::create_mem_store();

    let activities = ActivityRegistry::builder()
        .register_typed("Price", |req: QuoteRequest| async move {
            Ok(Quote {
                symbol: req.symbol,
                total_cents: u64::from(req.quantity) * 125,
            })
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("Buy", |ctx: OrchestrationContext, req: QuoteRequest| async move {
            let quote: Quote = ctx
                .schedule_activity_typed("Price", &req)
                .into_activity_typed()
                .await?;
            Ok(quote)
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client
        .start_orchestration_typed(
            "inst-typed",
            "Buy",
            QuoteRequest { symbol: "XYZ".to_string(), quantity: 4 },
        )
        .await
        .unwrap();

    let quote: Quote = client
        .wait_for_orchestration_typed("inst-typed", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(quote, Quote { symbol: "XYZ".to_string(), total_cents: 500 });

    rt.shutdown().await;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Decision {
    approved: bool,
    by: String,
}

#[tokio::test]
async fn typed_external_event_decodes_in_the_orchestrator() {
    let store = common::create_mem_store();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Review", |ctx: OrchestrationContext, _input: String| async move {
            let decision: Decision = ctx.schedule_wait("Verdict").into_event_typed().await?;
            if decision.approved {
                Ok(format!("approved by {}", decision.by))
            } else {
                Ok(format!("rejected by {}", decision.by))
            }
        })
        .build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
    )
    .await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-review", "Review", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "inst-review", "Verdict", 3000).await);
    client
        .raise_event_typed("inst-review", "Verdict", Decision { approved: true, by: "ops".to_string() })
        .await
        .unwrap();

    match client
        .wait_for_orchestration("inst-review", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "approved by ops"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn typed_sub_orchestration_round_trips_payloads() {
    let store = common::create_mem_store();

    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("QuoteChild", |_ctx: OrchestrationContext, req: QuoteRequest| async move {
            Ok(Quote { symbol: req.symbol, total_cents: u64::from(req.quantity) * 50 })
        })
        .register("Desk", |ctx: OrchestrationContext, _input: String| async move {
            let req = QuoteRequest { symbol: "DEF".to_string(), quantity: 6 };
            let quote: Quote = ctx
                .schedule_sub_orchestration_typed("QuoteChild", &req)
                .into_sub_orchestration_typed()
                .await?;
            Ok(format!("{}={}", quote.symbol, quote.total_cents))
        })
        .build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
    )
    .await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-desk", "Desk", "").await.unwrap();
    match client
        .wait_for_orchestration("inst-desk", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "DEF=300"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn malformed_input_fails_a_typed_orchestration() {
    let store = common::create_mem_store();

    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("Buy", |_ctx: OrchestrationContext, req: QuoteRequest| async move {
            Ok(req.symbol)
        })
        .build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
    )
    .await;
    let client = Client::new(store.clone());

    // Raw string start into a typed handler: the decode failure is the
    // handler's error, not an infrastructure fault.
    client
        .start_orchestration("inst-garbled", "Buy", "{\"quantity\":\"not a number\"}")
        .await
        .unwrap();

    match client
        .wait_for_orchestration("inst-garbled", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert_eq!(details.kind, ErrorKind::OrchestratorLogic);
            assert!(details.display_message().contains("decode input"));
        }
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn typed_activity_interoperates_with_untyped_caller() {
    let store = common::create_mem_store();

    // An untyped orchestrator hands the typed activity a JSON string and gets
    // JSON back; the codec keeps both sides on the same wire format.
    let activities = ActivityRegistry::builder()
        .register_typed("Price", |req: QuoteRequest| async move {
            Ok(Quote { symbol: req.symbol, total_cents: u64::from(req.quantity) * 100 })
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RawBuy", |ctx: OrchestrationContext, _input: String| async move {
            let raw = ctx
                .schedule_activity("Price", "{\"symbol\":\"ABC\",\"quantity\":3}")
                .into_activity()
                .await?;
            Ok(raw)
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-raw", "RawBuy", "").await.unwrap();
    match client
        .wait_for_orchestration("inst-raw", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(output, "{\"symbol\":\"ABC\",\"total_cents\":300}");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}
