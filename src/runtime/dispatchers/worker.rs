//! Work dispatcher: executes activities off the worker queue.
//!
//! Activities run in their own tasks so a panicking handler is contained and
//! reported as an ordinary activity failure. Completion enqueue and item ack
//! are one provider transaction; if it cannot be committed the lock expires
//! and the activity reruns, which is the at-least-once contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::WorkItem;
use crate::runtime::{kind_of, panic_text, Runtime};
use crate::ErrorDetails;

impl Runtime {
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency;

        tokio::spawn(async move {
            let mut workers = Vec::new();

            for _ in 0..concurrency {
                let rt = Arc::clone(&self);
                workers.push(tokio::spawn(async move {
                    loop {
                        if rt.is_shutdown() {
                            break;
                        }

                        match rt.store.fetch_work_item(rt.options.work_lock_timeout).await {
                            Ok(Some((item, token))) => {
                                rt.process_work_item(item, &token).await;
                            }
                            Ok(None) => {
                                rt.idle_sleep().await;
                            }
                            Err(e) => {
                                warn!(
                                    target: "duratask::runtime",
                                    error = %e,
                                    "error fetching work item"
                                );
                                rt.error_sleep().await;
                            }
                        }
                    }
                }));
            }

            for worker in workers {
                let _ = worker.await;
            }
        })
    }

    async fn process_work_item(&self, item: WorkItem, token: &str) {
        match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
                attempt,
            } => {
                debug!(
                    target: "duratask::runtime",
                    instance = %instance,
                    id,
                    activity = %name,
                    attempt,
                    "executing activity"
                );
                let completion = match self.activity_registry.resolve_handler(&name) {
                    None => WorkItem::ActivityFailed {
                        instance,
                        execution_id,
                        id,
                        details: ErrorDetails::activity_permanent(
                            format!("unregistered activity: {name}"),
                            attempt,
                        ),
                    },
                    Some((_version, handler)) => {
                        let invocation = tokio::spawn(async move { handler.invoke(input).await });
                        match invocation.await {
                            Ok(Ok(result)) => WorkItem::ActivityCompleted {
                                instance,
                                execution_id,
                                id,
                                result,
                            },
                            Ok(Err(message)) => WorkItem::ActivityFailed {
                                instance,
                                execution_id,
                                id,
                                details: ErrorDetails::activity(message, attempt),
                            },
                            Err(join_err) => {
                                let message = if join_err.is_panic() {
                                    format!("activity panicked: {}", panic_text(join_err.into_panic()))
                                } else {
                                    "activity task was cancelled".to_string()
                                };
                                WorkItem::ActivityFailed {
                                    instance,
                                    execution_id,
                                    id,
                                    details: ErrorDetails::activity(message, attempt),
                                }
                            }
                        }
                    }
                };
                self.ack_work_item_with_retry(token, Some(completion)).await;
            }
            other => {
                error!(
                    target: "duratask::runtime",
                    kind = kind_of(&other),
                    "unexpected item on worker queue; dropping"
                );
                self.ack_work_item_with_retry(token, None).await;
            }
        }
    }

    async fn ack_work_item_with_retry(&self, token: &str, completion: Option<WorkItem>) {
        let mut attempts: u32 = 0;
        loop {
            match self.store.ack_work_item(token, completion.clone()).await {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempts < 5 => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(
                        target: "duratask::runtime",
                        attempts,
                        backoff_ms,
                        error = %e,
                        "ack_work_item failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    // Lock expiry redelivers the item; the rerun's completion
                    // is deduplicated when folded into history.
                    warn!(
                        target: "duratask::runtime",
                        error = %e,
                        "could not ack work item; relying on redelivery"
                    );
                    return;
                }
            }
        }
    }
}
