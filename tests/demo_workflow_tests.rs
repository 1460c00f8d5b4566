mod common;

use std::path::PathBuf;
use std::time::Duration;

use duratask::runtime::registry::ActivityRegistry;
use duratask::runtime::{self};
use duratask::{Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};

async fn completed_output(client: &Client, instance: &str) -> String {
    match client
        .wait_for_orchestration(instance, Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("unexpected status: {other:?}"),
    }
}

/// A nightly batch job: fetch the dates to process, then generate one price
/// list per date, strictly in order. Activities do the I/O; the orchestrator
/// only sequences.
#[tokio::test]
async fn nightly_price_run_generates_one_file_per_date() {
    let store = common::create_mem_store();
    let out_dir = tempfile::tempdir().unwrap();
    let dir: PathBuf = out_dir.path().to_path_buf();

    let activities = ActivityRegistry::builder()
        .register("FetchDates", |_input: String| async move {
            Ok("2026-01-01,2026-01-02,2026-01-03".to_string())
        })
        .register("GeneratePriceList", move |date: String| {
            let dir = dir.clone();
            async move {
                let path = dir.join(format!("prices-{date}.csv"));
                let body = format!("date,sku,price_cents\n{date},SKU-1,999\n{date},SKU-2,1450\n");
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| format!("write {}: {e}", path.display()))?;
                Ok(date)
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("NightlyPriceRun", |ctx: OrchestrationContext, _input: String| async move {
            let dates = ctx.schedule_activity("FetchDates", "").into_activity().await?;
            let mut generated = Vec::new();
            for date in dates.split(',') {
                let done = ctx.schedule_activity("GeneratePriceList", date).into_activity().await?;
                duratask::durable_info!(ctx, date = %done, "price list generated");
                generated.push(done);
            }
            Ok(generated.join(","))
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("nightly-2026-01", "NightlyPriceRun", "").await.unwrap();
    assert_eq!(
        completed_output(&client, "nightly-2026-01").await,
        "2026-01-01,2026-01-02,2026-01-03"
    );

    for date in ["2026-01-01", "2026-01-02", "2026-01-03"] {
        let path = out_dir.path().join(format!("prices-{date}.csv"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("date,sku,price_cents\n"), "bad header in {}", path.display());
        assert!(body.contains(&format!("{date},SKU-1,999")));
    }

    rt.shutdown().await;
}

/// An import pipeline: the parent fans one child orchestration out per
/// partition and aggregates their results; each child produces its artifact
/// through an activity.
#[tokio::test]
async fn import_run_fans_out_one_child_per_partition() {
    let store = common::create_mem_store();
    let out_dir = tempfile::tempdir().unwrap();
    let dir: PathBuf = out_dir.path().to_path_buf();

    let activities = ActivityRegistry::builder()
        .register("WriteArtifact", move |partition: String| {
            let dir = dir.clone();
            async move {
                let path = dir.join(format!("import-{partition}.json"));
                let body = format!("{{\"partition\":\"{partition}\",\"rows\":42}}");
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| format!("write {}: {e}", path.display()))?;
                Ok(format!("ok:{partition}"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("ImportPartition", |ctx: OrchestrationContext, partition: String| async move {
            ctx.schedule_activity("WriteArtifact", partition).into_activity().await
        })
        .register("ImportRun", |ctx: OrchestrationContext, input: String| async move {
            let children = input
                .split(',')
                .map(|partition| ctx.schedule_sub_orchestration("ImportPartition", partition))
                .collect();
            let outs = ctx.when_all(children).await?;
            Ok(outs.join(";"))
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());

    client
        .start_orchestration("import-42", "ImportRun", "east,west,north")
        .await
        .unwrap();
    assert_eq!(completed_output(&client, "import-42").await, "ok:east;ok:west;ok:north");

    for partition in ["east", "west", "north"] {
        let path = out_dir.path().join(format!("import-{partition}.json"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains(&format!("\"partition\":\"{partition}\"")));
    }
    for id in 1..=3u64 {
        let child = format!("import-42::sub::{id}");
        assert!(matches!(
            client.get_orchestration_status(&child).await.unwrap(),
            OrchestrationStatus::Completed { .. }
        ));
    }

    rt.shutdown().await;
}
