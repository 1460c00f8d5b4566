//! In-memory provider for tests and samples. Same queue semantics as the
//! sqlite backend (per-instance batching, delayed visibility, peek locks)
//! with a single mutex standing in for the transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::providers::{OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::{now_ms, Event};

struct OrchRow {
    id: u64,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
}

struct LeaseRow {
    id: u64,
    item: WorkItem,
    lock_token: Option<String>,
    locked_until: u64,
}

impl LeaseRow {
    fn available(&self, now: u64) -> bool {
        self.lock_token.is_none() || self.locked_until <= now
    }
}

struct InstanceLock {
    token: String,
    locked_until: u64,
}

#[derive(Default)]
struct State {
    /// instance -> execution id -> ordered events.
    histories: HashMap<String, BTreeMap<u64, Vec<Event>>>,
    orchestrator: Vec<OrchRow>,
    worker: Vec<LeaseRow>,
    timer: Vec<LeaseRow>,
    locks: HashMap<String, InstanceLock>,
    next_row_id: u64,
    next_token: u64,
}

impl State {
    fn row_id(&mut self) -> u64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn mint_token(&mut self) -> String {
        self.next_token += 1;
        format!("mem-{}", self.next_token)
    }
}

#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .histories
            .get(instance)
            .and_then(|execs| execs.last_key_value())
            .map(|(_, events)| events.clone())
            .unwrap_or_default())
    }

    async fn read_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .histories
            .get(instance)
            .and_then(|execs| execs.get(&execution_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .histories
            .get(instance)
            .and_then(|execs| execs.last_key_value())
            .map(|(id, _)| *id))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().unwrap();
        let mut instances: Vec<String> = state.histories.keys().cloned().collect();
        instances.sort();
        Ok(instances)
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .histories
            .get(instance)
            .map(|execs| execs.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.histories.remove(instance);
        state.locks.remove(instance);
        state.orchestrator.retain(|r| r.item.instance() != instance);
        state.worker.retain(|r| r.item.instance() != instance);
        state.timer.retain(|r| r.item.instance() != instance);
        Ok(())
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let id = state.row_id();
        let visible_at = now_ms().saturating_add(delay_ms.unwrap_or(0));
        state.orchestrator.push(OrchRow {
            id,
            item,
            visible_at,
            lock_token: None,
        });
        Ok(())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();

        // A row marked by a live holder is shielded by the instance lock; a mark
        // whose lock expired must not keep the batch stuck.
        let mut candidate: Option<String> = None;
        for row in &state.orchestrator {
            if row.visible_at > now {
                continue;
            }
            let held = state
                .locks
                .get(row.item.instance())
                .map(|l| l.locked_until > now)
                .unwrap_or(false);
            if !held {
                candidate = Some(row.item.instance().to_string());
                break;
            }
        }
        let instance = match candidate {
            Some(instance) => instance,
            None => return Ok(None),
        };

        let token = state.mint_token();
        state.locks.insert(
            instance.clone(),
            InstanceLock {
                token: token.clone(),
                locked_until: now.saturating_add(lock_timeout.as_millis() as u64),
            },
        );

        // Marks left by an expired holder belong to us now.
        let mut batch: Vec<(u64, WorkItem)> = Vec::new();
        for row in state.orchestrator.iter_mut() {
            if row.item.instance() != instance {
                continue;
            }
            if row.lock_token.is_some() {
                row.lock_token = None;
            }
            if row.visible_at <= now {
                row.lock_token = Some(token.clone());
                batch.push((row.id, row.item.clone()));
            }
        }
        batch.sort_by_key(|(id, _)| *id);
        let messages = batch.into_iter().map(|(_, item)| item).collect();

        let (execution_id, history) = state
            .histories
            .get(&instance)
            .and_then(|execs| execs.last_key_value())
            .map(|(id, events)| (*id, events.clone()))
            .unwrap_or((1, Vec::new()));

        Ok(Some(OrchestrationItem {
            instance,
            lock_token: token,
            execution_id,
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
        let mut state = self.state.lock().unwrap();
        let instance = state
            .locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(instance, _)| instance.clone())
            .ok_or_else(|| {
                ProviderError::permanent("ack_orchestration_item", "unknown or expired lock token")
            })?;

        state
            .orchestrator
            .retain(|r| r.lock_token.as_deref() != Some(lock_token));

        if !history_delta.is_empty() {
            state
                .histories
                .entry(instance.clone())
                .or_default()
                .entry(execution_id)
                .or_default()
                .extend(history_delta);
        }

        for item in worker_items {
            let id = state.row_id();
            state.worker.push(LeaseRow {
                id,
                item,
                lock_token: None,
                locked_until: 0,
            });
        }
        for item in timer_items {
            let id = state.row_id();
            state.timer.push(LeaseRow {
                id,
                item,
                lock_token: None,
                locked_until: 0,
            });
        }
        let now = now_ms();
        for item in orchestrator_items {
            let id = state.row_id();
            state.orchestrator.push(OrchRow {
                id,
                item,
                visible_at: now,
                lock_token: None,
            });
        }

        state.locks.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(instance, _)| instance.clone())
            .ok_or_else(|| {
                ProviderError::permanent("abandon_orchestration_item", "unknown or expired lock token")
            })?;

        let visible_at = delay_ms.map(|d| now_ms().saturating_add(d));
        for row in state.orchestrator.iter_mut() {
            if row.lock_token.as_deref() == Some(lock_token) {
                row.lock_token = None;
                if let Some(at) = visible_at {
                    row.visible_at = at;
                }
            }
        }
        state.locks.remove(&instance);
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let id = state.row_id();
        state.worker.push(LeaseRow {
            id,
            item,
            lock_token: None,
            locked_until: 0,
        });
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();
        let token = state.mint_token();
        let locked_until = now.saturating_add(lock_timeout.as_millis() as u64);
        match state.worker.iter_mut().find(|r| r.available(now)) {
            Some(row) => {
                row.lock_token = Some(token.clone());
                row.locked_until = locked_until;
                Ok(Some((row.item.clone(), token)))
            }
            None => Ok(None),
        }
    }

    async fn ack_work_item(
        &self,
        token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let position = state
            .worker
            .iter()
            .position(|r| r.lock_token.as_deref() == Some(token))
            .ok_or_else(|| ProviderError::permanent("ack_work_item", "unknown or expired lock token"))?;
        state.worker.remove(position);
        if let Some(item) = completion {
            let id = state.row_id();
            let visible_at = now_ms();
            state.orchestrator.push(OrchRow {
                id,
                item,
                visible_at,
                lock_token: None,
            });
        }
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .worker
            .iter_mut()
            .find(|r| r.lock_token.as_deref() == Some(token))
            .ok_or_else(|| {
                ProviderError::permanent("abandon_work_item", "unknown or expired lock token")
            })?;
        row.lock_token = None;
        row.locked_until = 0;
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let id = state.row_id();
        state.timer.push(LeaseRow {
            id,
            item,
            lock_token: None,
            locked_until: 0,
        });
        Ok(())
    }

    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();
        let token = state.mint_token();
        let locked_until = now.saturating_add(lock_timeout.as_millis() as u64);
        match state.timer.iter_mut().find(|r| r.available(now)) {
            Some(row) => {
                row.lock_token = Some(token.clone());
                row.locked_until = locked_until;
                Ok(Some((row.item.clone(), token)))
            }
            None => Ok(None),
        }
    }

    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let position = state
            .timer
            .iter()
            .position(|r| r.lock_token.as_deref() == Some(token))
            .ok_or_else(|| ProviderError::permanent("ack_timer_item", "unknown or expired lock token"))?;
        state.timer.remove(position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_item(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: "Demo".to_string(),
            input: String::new(),
            version: None,
            parent_instance: None,
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn batches_all_visible_messages_for_one_instance() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("a"), None).await.unwrap();
        store
            .enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: "a".to_string(),
                    name: "go".to_string(),
                    data: "1".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        store.enqueue_orchestrator_work(start_item("b"), None).await.unwrap();

        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.messages.len(), 2);
        assert_eq!(item.execution_id, 1);
        assert!(item.history.is_empty());

        // Instance a is locked; the next fetch serves b.
        let other = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.instance, "b");
    }

    #[tokio::test]
    async fn ack_appends_history_and_releases_the_instance() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("a"), None).await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let delta = vec![Event::OrchestrationStarted {
            name: "Demo".to_string(),
            version: "1.0.0".to_string(),
            input: String::new(),
            parent_instance: None,
            parent_id: None,
        }];
        store
            .ack_orchestration_item(&item.lock_token, 1, delta, vec![], vec![], vec![])
            .await
            .unwrap();

        let history = store.read("a").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(store.latest_execution_id("a").await.unwrap(), Some(1));
        // Batch is gone; nothing left to fetch.
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delayed_items_stay_invisible_until_due() {
        let store = InMemoryProvider::new();
        store
            .enqueue_orchestrator_work(start_item("a"), Some(10_000))
            .await
            .unwrap();
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_worker_lock_redelivers() {
        let store = InMemoryProvider::new();
        store
            .enqueue_worker_work(WorkItem::ActivityExecute {
                instance: "a".to_string(),
                execution_id: 1,
                id: 1,
                name: "Noop".to_string(),
                input: String::new(),
                attempt: 1,
            })
            .await
            .unwrap();

        let first = store.fetch_work_item(Duration::from_millis(0)).await.unwrap();
        assert!(first.is_some());
        // Zero-length lease expires immediately; the item is available again.
        let second = store.fetch_work_item(Duration::from_secs(5)).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn work_item_ack_enqueues_completion() {
        let store = InMemoryProvider::new();
        store
            .enqueue_worker_work(WorkItem::ActivityExecute {
                instance: "a".to_string(),
                execution_id: 1,
                id: 1,
                name: "Noop".to_string(),
                input: String::new(),
                attempt: 1,
            })
            .await
            .unwrap();
        let (_, token) = store
            .fetch_work_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        store
            .ack_work_item(
                &token,
                Some(WorkItem::ActivityCompleted {
                    instance: "a".to_string(),
                    execution_id: 1,
                    id: 1,
                    result: "ok".to_string(),
                }),
            )
            .await
            .unwrap();

        let batch = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert!(matches!(batch.messages[0], WorkItem::ActivityCompleted { .. }));
        assert!(store.fetch_work_item(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_work_item_is_immediately_redeliverable() {
        let store = InMemoryProvider::new();
        store
            .enqueue_worker_work(WorkItem::ActivityExecute {
                instance: "a".to_string(),
                execution_id: 1,
                id: 1,
                name: "Noop".to_string(),
                input: String::new(),
                attempt: 1,
            })
            .await
            .unwrap();

        let (_, token) = store
            .fetch_work_item(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.abandon_work_item(&token).await.unwrap();
        // A released token cannot be reused.
        assert!(store.abandon_work_item(&token).await.is_err());

        // The lease is gone without waiting out the sixty seconds.
        assert!(store.fetch_work_item(Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_instance_purges_history_and_queued_work() {
        let store = InMemoryProvider::new();
        for instance in ["a", "b"] {
            store.enqueue_orchestrator_work(start_item(instance), None).await.unwrap();
            let item = store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            let delta = vec![Event::OrchestrationStarted {
                name: "Demo".to_string(),
                version: "1.0.0".to_string(),
                input: String::new(),
                parent_instance: None,
                parent_id: None,
            }];
            store
                .ack_orchestration_item(&item.lock_token, 1, delta, vec![], vec![], vec![])
                .await
                .unwrap();
        }
        store
            .enqueue_worker_work(WorkItem::ActivityExecute {
                instance: "a".to_string(),
                execution_id: 1,
                id: 1,
                name: "Noop".to_string(),
                input: String::new(),
                attempt: 1,
            })
            .await
            .unwrap();
        assert_eq!(store.list_instances().await.unwrap(), vec!["a", "b"]);

        store.remove_instance("a").await.unwrap();

        assert_eq!(store.list_instances().await.unwrap(), vec!["b"]);
        assert!(store.read("a").await.unwrap().is_empty());
        // The orphaned activity went with it.
        assert!(store.fetch_work_item(Duration::from_secs(5)).await.unwrap().is_none());
        assert!(!store.read("b").await.unwrap().is_empty());
    }
}
