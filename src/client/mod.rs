//! Control-plane client.
//!
//! The client talks to the runtime exclusively through the shared
//! [`Provider`]: starts, external events, and cancels are enqueued on the
//! orchestrator queue, and status is derived by reading history. It holds no
//! reference to a [`crate::runtime::Runtime`], so it works from any process
//! that can reach the store.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::Event;

/// Upper bound for the doubling poll interval in [`Client::wait_for_orchestration`].
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Control-plane handle bound to a [`Provider`].
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start an orchestration instance with string input. The version is
    /// resolved by the runtime's registry policy when the start is processed.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
            version: None,
            parent_instance: None,
            parent_id: None,
        };
        self.store.enqueue_orchestrator_work(item, None).await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
            version: Some(version.into()),
            parent_instance: None,
            parent_id: None,
        };
        self.store.enqueue_orchestrator_work(item, None).await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: In,
    ) -> Result<(), ProviderError> {
        let payload = Json::encode(&input)
            .map_err(|e| ProviderError::permanent("start_orchestration", format!("encode input: {e}")))?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Start a versioned orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_versioned_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: In,
    ) -> Result<(), ProviderError> {
        let payload = Json::encode(&input)
            .map_err(|e| ProviderError::permanent("start_orchestration", format!("encode input: {e}")))?;
        self.start_orchestration_versioned(instance, orchestration, version, payload)
            .await
    }

    /// Raise an external event into a running orchestration instance. Events
    /// with no live subscription are dropped by the runtime with a warning.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.into(),
            data: data.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await
    }

    /// Raise an external event with typed data (serialized to JSON).
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: T,
    ) -> Result<(), ProviderError> {
        let payload =
            Json::encode(&data).map_err(|e| ProviderError::permanent("raise_event", format!("encode data: {e}")))?;
        self.raise_event(instance, event_name, payload).await
    }

    /// Request cancellation of an orchestration instance. Cancellation is
    /// cooperative: it lands as a history event and the instance terminates
    /// on its next turn. Children started by the instance are not cancelled.
    pub async fn cancel_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let item = WorkItem::CancelInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await
    }

    /// Status of the latest execution, derived from history.
    pub async fn get_orchestration_status(
        &self,
        instance: &str,
    ) -> Result<OrchestrationStatus, ProviderError> {
        let Some(execution_id) = self.store.latest_execution_id(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        self.get_orchestration_status_with_execution(instance, execution_id)
            .await
    }

    /// Status of one specific execution of an instance.
    pub async fn get_orchestration_status_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<OrchestrationStatus, ProviderError> {
        let history = self.store.read_with_execution(instance, execution_id).await?;
        Ok(status_from_history(&history))
    }

    /// Poll until the instance reaches `Completed`, `Failed`, or `Terminated`,
    /// or until `timeout` elapses. `NotFound` keeps polling (the start message
    /// may not have been processed yet), as does the transient `ContinuedAsNew`
    /// status of an execution that has already rolled over.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = Duration::from_millis(5);
        loop {
            match self.get_orchestration_status(instance).await {
                Ok(
                    status @ (OrchestrationStatus::Completed { .. }
                    | OrchestrationStatus::Failed { .. }
                    | OrchestrationStatus::Terminated { .. }),
                ) => return Ok(status),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Wait for completion and decode the output as JSON. Failure and
    /// termination surface as [`WaitError::Other`] with the recorded message.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Out, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => {
                Json::decode(&output).map_err(|e| WaitError::Other(format!("decode output: {e}")))
            }
            OrchestrationStatus::Failed { details } => {
                Err(WaitError::Other(details.display_message()))
            }
            OrchestrationStatus::Terminated { reason } => {
                Err(WaitError::Other(format!("terminated: {reason}")))
            }
            status => Err(WaitError::Other(format!("unexpected status: {status:?}"))),
        }
    }

    /// Execution ids recorded for an instance, ascending. Instances that never
    /// continued-as-new have exactly one.
    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        self.store.list_executions(instance).await
    }

    /// Full event history of one execution.
    pub async fn read_execution_history(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        self.store.read_with_execution(instance, execution_id).await
    }
}

/// Map an execution's history onto a status. The terminal event, if present,
/// is the last one appended, but scanning forward keeps this robust to
/// trailing noise.
fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for event in history {
        match event {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { details } => {
                return OrchestrationStatus::Failed { details: details.clone() };
            }
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            Event::OrchestrationContinuedAsNew { .. } => {
                return OrchestrationStatus::ContinuedAsNew;
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}
