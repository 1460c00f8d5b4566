//! Runtime host: dispatcher loops driving orchestrations and activities
//! against a [`Provider`].
//!
//! Three loops cooperate over the provider's queues:
//! - the orchestration dispatcher fetches an instance's visible message batch
//!   under an instance lock, replays the orchestrator over its history, and
//!   commits the resulting history delta plus follow-on work in one ack,
//! - the work dispatcher executes activities and enqueues their completions
//!   back to the orchestrator queue atomically with the ack,
//! - the timer dispatcher converts durable timer schedules into delayed
//!   `TimerFired` messages.
//!
//! All three rely on peek-lock delivery: a crashed worker's lock expires and
//! the item is redelivered, so every handoff is at-least-once and the replay
//! engine deduplicates on correlation id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::providers::{Provider, WorkItem};
use crate::{ErrorDetails, OrchestrationContext};

pub mod registry;

mod dispatchers;
mod execution;
mod replay_engine;

pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
    VersionPolicy,
};

/// Status of an orchestration instance, derived from the latest execution's
/// history. `ContinuedAsNew` is transient: the next execution of the same
/// instance is already queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
    ContinuedAsNew,
}

/// Error from [`crate::client::Client::wait_for_orchestration`].
#[derive(Debug)]
pub enum WaitError {
    /// Deadline elapsed before the instance reached a terminal status.
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for WaitError {}

/// Orchestrator entry point. Implementations must be deterministic: all
/// side effects and time go through the [`OrchestrationContext`].
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Activity entry point. Activities run outside replay and may do arbitrary
/// I/O; they must tolerate at-least-once invocation.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

/// Adapter turning an async closure into an [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Adapter turning an async closure into an [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

/// Best-effort text out of a panic payload.
pub(in crate::runtime) fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub fn kind_of(msg: &WorkItem) -> &'static str {
    match msg {
        WorkItem::StartOrchestration { .. } => "StartOrchestration",
        WorkItem::ActivityExecute { .. } => "ActivityExecute",
        WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
        WorkItem::ActivityFailed { .. } => "ActivityFailed",
        WorkItem::TimerSchedule { .. } => "TimerSchedule",
        WorkItem::TimerFired { .. } => "TimerFired",
        WorkItem::ExternalRaised { .. } => "ExternalRaised",
        WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
        WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
        WorkItem::CancelInstance { .. } => "CancelInstance",
        WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
    }
}

/// Tuning knobs for the dispatcher loops. Defaults suit tests and small
/// deployments; production hosts mostly raise the concurrency numbers.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent orchestration turns. Instance locks in the provider keep
    /// two workers off the same instance, so this bounds distinct instances
    /// in flight.
    pub orchestration_concurrency: usize,
    /// Concurrent activity executions.
    pub worker_concurrency: usize,
    /// Sleep between polls when a queue comes up empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Peek-lock duration for orchestration batches. Must comfortably exceed
    /// one turn plus the ack round trip.
    pub orchestration_lock_timeout: Duration,
    /// Peek-lock duration for activity and timer items.
    pub work_lock_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep_ms: 10,
            orchestration_lock_timeout: Duration::from_secs(30),
            work_lock_timeout: Duration::from_secs(30),
        }
    }
}

/// A running host. Dropping the handle does not stop the dispatchers; call
/// [`shutdown`](Runtime::shutdown).
pub struct Runtime {
    joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    options: RuntimeOptions,
    shutdown: Arc<AtomicBool>,
}

impl Runtime {
    /// Start dispatchers over `store` with default [`RuntimeOptions`].
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Host-level subscriber for binaries that did not install one; a no-op
        // when the embedding application already has a global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let rt = Arc::new(Self {
            joins: tokio::sync::Mutex::new(Vec::new()),
            store,
            orchestration_registry,
            activity_registry,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let mut joins = rt.joins.lock().await;
        joins.push(Arc::clone(&rt).start_orchestration_dispatcher());
        joins.push(Arc::clone(&rt).start_work_dispatcher());
        joins.push(Arc::clone(&rt).start_timer_dispatcher());
        drop(joins);

        rt
    }

    /// Signal the dispatchers to stop and abort their tasks. In-flight locks
    /// are left to expire and redeliver.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            handle.abort();
        }
    }

    pub(in crate::runtime) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(in crate::runtime) async fn idle_sleep(&self) {
        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
    }

    /// Backoff after a provider fetch error so a broken store does not spin
    /// the dispatcher hot.
    pub(in crate::runtime) async fn error_sleep(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
