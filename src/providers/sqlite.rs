//! SQLite-backed provider. Histories, queues, and instance locks live in one
//! database file; WAL mode plus a busy timeout lets the dispatchers share it.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::Event;

/// SQLite-backed provider. Every mutation runs in a transaction, so the
/// batch ack (delete messages + append history + enqueue follow-ups) commits
/// or rolls back as one unit.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Map sqlx failures to a retry classification.
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let message = e.to_string();
        if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("database locked: {message}"));
        }
        if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("constraint violation: {message}"));
        }
        if message.contains("connection") || message.contains("timeout") {
            return ProviderError::retryable(operation, format!("connection error: {message}"));
        }
        ProviderError::retryable(operation, message)
    }

    /// Open (creating the schema if needed). `database_url` is an sqlx
    /// connection string such as `sqlite://orchestrations.db?mode=rwc`.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Shared-cache in-memory store; multiple pooled connections see the
    /// same database.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:?cache=shared").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, execution_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS timer_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_instance ON orchestrator_queue(instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(lock_token, id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_timer_available ON timer_queue(lock_token, id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn generate_lock_token() -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX epoch")
            .as_nanos();
        format!("lock_{now}_{}", std::process::id())
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX epoch")
            .as_millis() as i64
    }

    fn timestamp_after(duration: Duration) -> i64 {
        Self::now_millis().saturating_add(duration.as_millis().min(i64::MAX as u128) as i64)
    }

    fn encode_event(operation: &str, event: &Event) -> Result<String, ProviderError> {
        serde_json::to_string(event)
            .map_err(|e| ProviderError::permanent(operation, format!("serialization error: {e}")))
    }

    fn encode_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item)
            .map_err(|e| ProviderError::permanent(operation, format!("serialization error: {e}")))
    }

    fn decode_event(operation: &str, raw: &str) -> Result<Event, ProviderError> {
        serde_json::from_str(raw)
            .map_err(|e| ProviderError::permanent(operation, format!("corrupt history row: {e}")))
    }

    fn decode_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw)
            .map_err(|e| ProviderError::permanent(operation, format!("corrupt queue row: {e}")))
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
        execution_id: i64,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            "SELECT event_data FROM history WHERE instance_id = ?1 AND execution_id = ?2 ORDER BY seq",
        )
        .bind(instance)
        .bind(execution_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("event_data")
                    .map_err(|e| ProviderError::permanent(operation, format!("missing event_data: {e}")))?;
                Self::decode_event(operation, &raw)
            })
            .collect()
    }

    async fn current_execution_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
    ) -> Result<Option<i64>, ProviderError> {
        sqlx::query_scalar("SELECT current_execution_id FROM instances WHERE instance_id = ?1")
            .bind(instance)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn fetch_leased(
        &self,
        operation: &'static str,
        table: &str,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        let now = Self::now_millis();
        let row = sqlx::query(&format!(
            "SELECT id, work_item FROM {table} WHERE lock_token IS NULL OR locked_until <= ?1 ORDER BY id LIMIT 1"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;

        let row = match row {
            Some(row) => row,
            None => {
                tx.rollback().await.ok();
                return Ok(None);
            }
        };
        let id: i64 = row
            .try_get("id")
            .map_err(|e| ProviderError::permanent(operation, format!("missing id: {e}")))?;
        let raw: String = row
            .try_get("work_item")
            .map_err(|e| ProviderError::permanent(operation, format!("missing work_item: {e}")))?;
        let item = Self::decode_item(operation, &raw)?;

        let token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);
        sqlx::query(&format!(
            "UPDATE {table} SET lock_token = ?1, locked_until = ?2 WHERE id = ?3"
        ))
        .bind(&token)
        .bind(locked_until)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(Some((item, token)))
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        let execution = Self::current_execution_in_tx(&mut tx, "read", instance).await?;
        let events = match execution {
            Some(execution_id) => Self::read_history_in_tx(&mut tx, "read", instance, execution_id).await?,
            None => Vec::new(),
        };
        tx.rollback().await.ok();
        Ok(events)
    }

    async fn read_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read_with_execution", e))?;
        let events =
            Self::read_history_in_tx(&mut tx, "read_with_execution", instance, execution_id as i64).await?;
        tx.rollback().await.ok();
        Ok(events)
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let execution: Option<i64> =
            sqlx::query_scalar("SELECT current_execution_id FROM instances WHERE instance_id = ?1")
                .bind(instance)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("latest_execution_id", e))?;
        Ok(execution.map(|id| id as u64))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT execution_id FROM history WHERE instance_id = ?1 ORDER BY execution_id",
        )
        .bind(instance)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;
        Ok(rows.into_iter().map(|id| id as u64).collect())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        for statement in [
            "DELETE FROM history WHERE instance_id = ?1",
            "DELETE FROM instances WHERE instance_id = ?1",
            "DELETE FROM instance_locks WHERE instance_id = ?1",
            "DELETE FROM orchestrator_queue WHERE instance_id = ?1",
            "DELETE FROM worker_queue WHERE instance_id = ?1",
            "DELETE FROM timer_queue WHERE instance_id = ?1",
        ] {
            sqlx::query(statement)
                .bind(instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("remove_instance", e))
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let raw = Self::encode_item("enqueue_orchestrator_work", &item)?;
        let visible_at = Self::now_millis().saturating_add(delay_ms.unwrap_or(0).min(i64::MAX as u64) as i64);
        tracing::debug!(
            target: "duratask::providers::sqlite",
            instance = %item.instance(),
            delay_ms = ?delay_ms,
            "enqueue orchestrator work"
        );
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?1, ?2, ?3)")
            .bind(item.instance())
            .bind(raw)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_orchestrator_work", e))?;
        Ok(())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        let now = Self::now_millis();

        // Candidate: an instance with visible messages whose instance lock is
        // absent or expired.
        let row = sqlx::query(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let instance: String = match row {
            Some(row) => row
                .try_get("instance_id")
                .map_err(|e| ProviderError::permanent("fetch_orchestration_item", format!("missing instance_id: {e}")))?,
            None => {
                tx.rollback().await.ok();
                return Ok(None);
            }
        };

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);
        let lock_result = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        if lock_result.rows_affected() == 0 {
            // Another dispatcher holds the instance.
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Mark every visible message, including marks left by an expired
        // holder, so a crashed-and-redelivered batch is recovered whole.
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = ?1 WHERE instance_id = ?2 AND visible_at <= ?3",
        )
        .bind(&lock_token)
        .bind(&instance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ?1 ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        if rows.is_empty() {
            // Rolling back also discards the instance lock taken above.
            tx.rollback().await.ok();
            return Ok(None);
        }
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row
                .try_get("work_item")
                .map_err(|e| ProviderError::permanent("fetch_orchestration_item", format!("missing work_item: {e}")))?;
            messages.push(Self::decode_item("fetch_orchestration_item", &raw)?);
        }

        let execution_id = Self::current_execution_in_tx(&mut tx, "fetch_orchestration_item", &instance)
            .await?
            .unwrap_or(1);
        let history =
            Self::read_history_in_tx(&mut tx, "fetch_orchestration_item", &instance, execution_id).await?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        tracing::debug!(
            target: "duratask::providers::sqlite",
            instance = %instance,
            messages = messages.len(),
            execution_id,
            "locked orchestration batch"
        );
        Ok(Some(OrchestrationItem {
            instance,
            lock_token,
            execution_id: execution_id as u64,
            history,
            messages,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        let instance: Option<String> =
            sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?1")
                .bind(lock_token)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        let instance = instance.ok_or_else(|| {
            ProviderError::permanent("ack_orchestration_item", "unknown or expired lock token")
        })?;

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?1")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        if !history_delta.is_empty() {
            let base_seq: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(seq), 0) FROM history WHERE instance_id = ?1 AND execution_id = ?2",
            )
            .bind(&instance)
            .bind(execution_id as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

            for (offset, event) in history_delta.iter().enumerate() {
                let raw = Self::encode_event("ack_orchestration_item", event)?;
                sqlx::query(
                    "INSERT INTO history (instance_id, execution_id, seq, event_data) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&instance)
                .bind(execution_id as i64)
                .bind(base_seq + 1 + offset as i64)
                .bind(raw)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
            }

            sqlx::query(
                r#"
                INSERT INTO instances (instance_id, current_execution_id, created_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(instance_id) DO UPDATE
                SET current_execution_id = excluded.current_execution_id
                WHERE excluded.current_execution_id > instances.current_execution_id
                "#,
            )
            .bind(&instance)
            .bind(execution_id as i64)
            .bind(Self::now_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        for item in &worker_items {
            let raw = Self::encode_item("ack_orchestration_item", item)?;
            sqlx::query("INSERT INTO worker_queue (instance_id, work_item) VALUES (?1, ?2)")
                .bind(item.instance())
                .bind(raw)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }
        for item in &timer_items {
            let raw = Self::encode_item("ack_orchestration_item", item)?;
            sqlx::query("INSERT INTO timer_queue (instance_id, work_item) VALUES (?1, ?2)")
                .bind(item.instance())
                .bind(raw)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }
        let now = Self::now_millis();
        for item in &orchestrator_items {
            let raw = Self::encode_item("ack_orchestration_item", item)?;
            sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?1, ?2, ?3)")
                .bind(item.instance())
                .bind(raw)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ?1")
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        tracing::debug!(
            target: "duratask::providers::sqlite",
            instance = %instance,
            execution_id,
            appended = history_delta.len(),
            worker = worker_items.len(),
            timer = timer_items.len(),
            orchestrator = orchestrator_items.len(),
            "acked orchestration batch"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        let instance: Option<String> =
            sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?1")
                .bind(lock_token)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        let instance = instance.ok_or_else(|| {
            ProviderError::permanent("abandon_orchestration_item", "unknown or expired lock token")
        })?;

        match delay_ms {
            Some(delay) => {
                let visible_at = Self::now_millis().saturating_add(delay.min(i64::MAX as u64) as i64);
                sqlx::query(
                    "UPDATE orchestrator_queue SET lock_token = NULL, visible_at = ?1 WHERE lock_token = ?2",
                )
                .bind(visible_at)
                .bind(lock_token)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
            }
            None => {
                sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL WHERE lock_token = ?1")
                    .bind(lock_token)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
            }
        }
        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ?1")
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let raw = Self::encode_item("enqueue_worker_work", &item)?;
        sqlx::query("INSERT INTO worker_queue (instance_id, work_item) VALUES (?1, ?2)")
            .bind(item.instance())
            .bind(raw)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_worker_work", e))?;
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.fetch_leased("fetch_work_item", "worker_queue", lock_timeout).await
    }

    async fn ack_work_item(
        &self,
        token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        let deleted = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?1")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent("ack_work_item", "unknown or expired lock token"));
        }
        if let Some(item) = completion {
            let raw = Self::encode_item("ack_work_item", &item)?;
            sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?1, ?2, ?3)")
                .bind(item.instance())
                .bind(raw)
                .bind(Self::now_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))
    }

    async fn abandon_work_item(&self, token: &str) -> Result<(), ProviderError> {
        let updated =
            sqlx::query("UPDATE worker_queue SET lock_token = NULL, locked_until = NULL WHERE lock_token = ?1")
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_work_item", e))?;
        if updated.rows_affected() == 0 {
            return Err(ProviderError::permanent("abandon_work_item", "unknown or expired lock token"));
        }
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let raw = Self::encode_item("enqueue_timer_work", &item)?;
        sqlx::query("INSERT INTO timer_queue (instance_id, work_item) VALUES (?1, ?2)")
            .bind(item.instance())
            .bind(raw)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_timer_work", e))?;
        Ok(())
    }

    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.fetch_leased("fetch_timer_item", "timer_queue", lock_timeout).await
    }

    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError> {
        let deleted = sqlx::query("DELETE FROM timer_queue WHERE lock_token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_timer_item", e))?;
        if deleted.rows_affected() == 0 {
            return Err(ProviderError::permanent("ack_timer_item", "unknown or expired lock token"));
        }
        Ok(())
    }
}
