pub mod tracing_capture;

use std::sync::Arc;
use std::time::{Duration, Instant};

use duratask::providers::in_memory::InMemoryProvider;
use duratask::providers::sqlite::SqliteProvider;
use duratask::providers::Provider;
use duratask::Event;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn create_mem_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new())
}

/// File-backed sqlite store in a fresh temp dir. Keep the `TempDir` alive for
/// the duration of the test; dropping it deletes the database.
#[allow(dead_code)]
pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url).await.unwrap()) as Arc<dyn Provider>;
    (store, td)
}

/// Reopen an existing sqlite database, as a restarted host would.
#[allow(dead_code)]
pub async fn reopen_sqlite_store_disk(td: &TempDir) -> Arc<dyn Provider> {
    let db_url = format!("sqlite:{}", td.path().join("test.db").display());
    Arc::new(SqliteProvider::new(&db_url).await.unwrap()) as Arc<dyn Provider>
}

/// Poll the latest execution's history until `predicate` holds or the timeout
/// elapses.
#[allow(dead_code)]
pub async fn wait_for_history<F>(
    store: Arc<dyn Provider>,
    instance: &str,
    predicate: F,
    timeout_ms: u64,
) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub async fn wait_for_subscription(
    store: Arc<dyn Provider>,
    instance: &str,
    name: &str,
    timeout_ms: u64,
) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}
