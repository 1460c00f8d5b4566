//! Persistence contract: append-only history plus three peek-lock queues
//! (orchestrator, worker, timer).
//!
//! The orchestrator queue is batched per instance: a fetch takes an
//! instance-level lock and returns every currently visible message for that
//! instance together with its current execution history. The matching ack is
//! transactional, committing the history delta and all follow-up work items
//! together with the message deletions. A turn that crashes before its ack
//! therefore leaves no trace and redelivers cleanly.
//!
//! Worker and timer queues are plain single-item peek-lock queues. Their
//! two-step hand-offs (timer fired enqueue then ack) are safe because
//! duplicate completions are dropped during history folding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Queue message. Instance routing comes from [`WorkItem::instance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Begin (or continue-as-new into) an orchestration instance.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Run one activity attempt on a worker.
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    /// Pending timer, parked on the timer queue until converted.
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// External event raised through the client.
    ExternalRaised { instance: String, name: String, data: String },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    CancelInstance { instance: String, reason: String },
    /// Roll the instance over to a fresh execution with new input.
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
    },
}

impl WorkItem {
    /// Instance the item is addressed to (the parent for sub-orchestration
    /// notifications).
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. }
            | WorkItem::SubOrchFailed { parent_instance, .. } => parent_instance,
        }
    }
}

/// One locked orchestrator-queue batch: every visible message for `instance`
/// plus the current execution's history, held under `lock_token` until acked
/// or abandoned.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub lock_token: String,
    /// Latest execution id; 1 for instances with no history yet.
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
}

/// Storage backend: history plus the three queues. Every call is
/// crash-atomic; `ack_orchestration_item` is the transactional heart of the
/// engine.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Read the latest execution's history. Empty if unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Read one execution's history. Empty if unknown.
    async fn read_with_execution(&self, instance: &str, execution_id: u64)
        -> Result<Vec<Event>, ProviderError>;

    /// Latest execution id, or `None` for an unknown instance.
    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Execution ids for an instance, ascending.
    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    /// Drop an instance's history and any queued messages addressed to it.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Enqueue for the orchestration dispatcher; `delay_ms` defers visibility.
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// Lock the next instance with visible messages and return its batch.
    /// `None` when nothing is ready.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Atomically: delete the locked batch, append `history_delta` under
    /// `(instance, execution_id)`, enqueue all follow-up items, release the
    /// instance lock. All or nothing.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release a locked batch unchanged for redelivery, optionally deferring
    /// its visibility.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next worker item. Expired locks make items visible again.
    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Atomically delete the locked item and enqueue its completion (if any)
    /// on the orchestrator queue.
    async fn ack_work_item(&self, token: &str, completion: Option<WorkItem>)
        -> Result<(), ProviderError>;

    /// Release a locked worker item unchanged for redelivery.
    async fn abandon_work_item(&self, token: &str) -> Result<(), ProviderError>;

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next timer item. Expired locks make items visible again.
    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete a locked timer item. The fired message is enqueued separately
    /// beforehand; a crash in between only yields a duplicate that history
    /// folding drops.
    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError>;
}
