mod common;

use std::collections::HashMap;
use std::time::Duration;

use duratask::providers::WorkItem;
use duratask::runtime::registry::ActivityRegistry;
use duratask::runtime::{self};
use duratask::{
    run_turn, Client, ErrorKind, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
};

async fn order_flow(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let reserved = ctx.schedule_activity("Reserve", input).into_activity().await?;
    ctx.schedule_timer(Duration::from_millis(10)).into_timer().await;
    let shipped = ctx.schedule_activity("Ship", reserved).into_activity().await?;
    Ok(shipped)
}

fn order_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Reserve", |input: String| async move { Ok(format!("reserved:{input}")) })
        .register("Ship", |input: String| async move { Ok(format!("shipped:{input}")) })
        .build()
}

#[tokio::test]
async fn replay_of_completed_history_is_pure() {
    let store = common::create_mem_store();
    let orchestrations = OrchestrationRegistry::builder().register("OrderFlow", order_flow).build();
    let rt = runtime::Runtime::start_with_store(store.clone(), order_activities(), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-replay", "OrderFlow", "widget").await.unwrap();
    let output = match client
        .wait_for_orchestration("inst-replay", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("unexpected status: {other:?}"),
    };
    assert_eq!(output, "shipped:reserved:widget");
    rt.shutdown().await;

    // Replaying the recorded history through the same code is a pure read:
    // no new events, no actions, and the same terminal output.
    let hist = store.read("inst-replay").await.unwrap();
    let (replayed, actions, out) = run_turn(hist.clone(), |ctx| order_flow(ctx, "widget".to_string()));
    assert_eq!(replayed, hist);
    assert!(actions.is_empty());
    assert_eq!(out, Some(Ok(output)));
}

#[tokio::test]
async fn completed_instance_scheduled_each_operation_exactly_once() {
    let store = common::create_mem_store();
    let orchestrations = OrchestrationRegistry::builder().register("OrderFlow", order_flow).build();
    let rt = runtime::Runtime::start_with_store(store.clone(), order_activities(), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-once", "OrderFlow", "gadget").await.unwrap();
    client
        .wait_for_orchestration("inst-once", Duration::from_secs(5))
        .await
        .unwrap();
    rt.shutdown().await;

    // Three turns ran (activity, timer, activity), each replaying the prior
    // schedules; every correlation id must still appear exactly once.
    let hist = store.read("inst-once").await.unwrap();
    let mut schedule_counts: HashMap<u64, usize> = HashMap::new();
    for event in &hist {
        let id = match event {
            Event::ActivityScheduled { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::ExternalSubscribed { id, .. }
            | Event::SubOrchestrationScheduled { id, .. } => *id,
            _ => continue,
        };
        *schedule_counts.entry(id).or_default() += 1;
    }
    assert_eq!(schedule_counts.len(), 3);
    assert!(schedule_counts.values().all(|&c| c == 1), "duplicate schedule: {schedule_counts:?}");
}

#[tokio::test]
async fn code_swap_between_restarts_fails_loudly() {
    let (store, td) = common::create_sqlite_store_disk().await;

    // First deployment: prepare, then wait for a signal.
    let orchestrations_v1 = OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, input: String| async move {
            let prepared = ctx.schedule_activity("Prepare", input).into_activity().await?;
            let _ = ctx.schedule_wait("Go").into_event().await;
            Ok(prepared)
        })
        .build();
    let activities = ActivityRegistry::builder()
        .register("Prepare", |input: String| async move { Ok(format!("prepared:{input}")) })
        .register("Audit", |input: String| async move { Ok(input) })
        .build();

    let rt1 = runtime::Runtime::start_with_store(store.clone(), activities.clone(), orchestrations_v1).await;
    let client = Client::new(store.clone());
    client.start_orchestration("inst-swap", "Pipeline", "x").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "inst-swap", "Go", 3000).await);
    rt1.shutdown().await;

    // Second deployment swaps the code under the same name and version: it
    // now issues a different first operation. Replay must refuse to guess.
    let store2 = common::reopen_sqlite_store_disk(&td).await;
    let orchestrations_v2 = OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, input: String| async move {
            let audited = ctx.schedule_activity("Audit", input).into_activity().await?;
            let _ = ctx.schedule_wait("Go").into_event().await;
            Ok(audited)
        })
        .build();
    let rt2 = runtime::Runtime::start_with_store(store2.clone(), activities, orchestrations_v2).await;
    let client2 = Client::new(store2.clone());
    client2.raise_event("inst-swap", "Go", "now").await.unwrap();

    match client2
        .wait_for_orchestration("inst-swap", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert_eq!(details.kind, ErrorKind::Nondeterminism);
            assert!(details.message.contains("schedule order mismatch"), "got: {}", details.message);
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert!(matches!(
        store2.read("inst-swap").await.unwrap().last(),
        Some(Event::OrchestrationFailed { .. })
    ));

    rt2.shutdown().await;
}

#[tokio::test]
async fn mismatched_completion_kind_fails_instance() {
    use tracing::Level;
    let capture = common::tracing_capture::LogCapture::install();

    let store = common::create_mem_store();

    let orchestrations = OrchestrationRegistry::builder()
        .register("LongSleep", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_secs(10)).into_timer().await;
            Ok("woke".to_string())
        })
        .build();
    let rt = runtime::Runtime::start_with_store(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
    )
    .await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-mismatch", "LongSleep", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "inst-mismatch",
            |hist| hist.iter().any(|e| matches!(e, Event::TimerCreated { id: 1, .. })),
            3000,
        )
        .await
    );

    // An activity completion arriving for a correlation id that history
    // records as a timer is corrupted state, not something to patch over.
    store
        .enqueue_orchestrator_work(
            WorkItem::ActivityCompleted {
                instance: "inst-mismatch".to_string(),
                execution_id: 1,
                id: 1,
                result: "bogus".to_string(),
            },
            None,
        )
        .await
        .unwrap();

    match client
        .wait_for_orchestration("inst-mismatch", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert_eq!(details.kind, ErrorKind::Nondeterminism);
            assert!(details.message.contains("completion kind mismatch"), "got: {}", details.message);
        }
        other => panic!("unexpected status: {other:?}"),
    }

    // The divergence is also an operator problem, so it must hit the logs.
    let diverged = capture
        .find(Level::ERROR, "replay diverged from recorded history")
        .expect("divergence should be logged at error level");
    assert_eq!(diverged.target, "duratask::runtime");
    assert_eq!(diverged.field("instance").as_deref(), Some("inst-mismatch"));
    assert!(
        diverged.field("error").unwrap_or_default().contains("completion kind mismatch"),
        "got: {:?}",
        diverged.fields
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn replayed_code_does_not_log_twice() {
    use tracing::Level;
    let capture = common::tracing_capture::LogCapture::install();

    let store = common::create_mem_store();

    // Three turns, one log per stage. Each line re-executes on every later
    // turn but must only reach the subscriber the first time its stage runs.
    let orchestrations = OrchestrationRegistry::builder()
        .register("Ingest", |ctx: OrchestrationContext, input: String| async move {
            ctx.trace_info("ingest starting");
            let data = match ctx.schedule_activity("Fetch", input.clone()).into_activity().await {
                Ok(data) => data,
                Err(e) => {
                    ctx.trace_error(format!("primary fetch failed: {e}"));
                    ctx.schedule_activity("FetchMirror", input).into_activity().await?
                }
            };
            ctx.trace_warn("ingest took the mirror path");
            Ok(data)
        })
        .build();
    let activities = ActivityRegistry::builder()
        .register("Fetch", |_input: String| async move { Err("primary unreachable".to_string()) })
        .register("FetchMirror", |input: String| async move { Ok(format!("mirror:{input}")) })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-log-once", "Ingest", "feed").await.unwrap();
    match client
        .wait_for_orchestration("inst-log-once", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "mirror:feed"),
        other => panic!("unexpected status: {other:?}"),
    }
    rt.shutdown().await;

    for (level, needle) in [
        (Level::INFO, "ingest starting"),
        (Level::ERROR, "primary fetch failed"),
        (Level::WARN, "ingest took the mirror path"),
    ] {
        let hits: Vec<_> = capture
            .records()
            .into_iter()
            .filter(|r| r.level == level && r.message.contains(needle))
            .collect();
        assert_eq!(hits.len(), 1, "{needle:?} logged {} times", hits.len());
        assert_eq!(hits[0].target, "duratask::orchestration");
    }
}
