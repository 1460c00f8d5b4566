//! Timer dispatcher: turns durable timer schedules into delayed fired
//! messages on the orchestrator queue.
//!
//! The handoff is enqueue-then-ack. A crash between the two steps redelivers
//! the schedule and produces a second fired message; history folding drops it
//! as a duplicate completion. The opposite order could lose a timer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::now_ms;
use crate::providers::WorkItem;
use crate::runtime::{kind_of, Runtime};

impl Runtime {
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutdown() {
                    break;
                }

                match self.store.fetch_timer_item(self.options.work_lock_timeout).await {
                    Ok(Some((item, token))) => {
                        self.process_timer_item(item, &token).await;
                    }
                    Ok(None) => {
                        self.idle_sleep().await;
                    }
                    Err(e) => {
                        warn!(
                            target: "duratask::runtime",
                            error = %e,
                            "error fetching timer item"
                        );
                        self.error_sleep().await;
                    }
                }
            }
        })
    }

    async fn process_timer_item(&self, item: WorkItem, token: &str) {
        match item {
            WorkItem::TimerSchedule {
                instance,
                execution_id,
                id,
                fire_at_ms,
            } => {
                let delay_ms = fire_at_ms.saturating_sub(now_ms());
                let fired = WorkItem::TimerFired {
                    instance,
                    execution_id,
                    id,
                    fire_at_ms,
                };
                match self.store.enqueue_orchestrator_work(fired, Some(delay_ms)).await {
                    Ok(()) => {
                        if let Err(e) = self.store.ack_timer_item(token).await {
                            warn!(
                                target: "duratask::runtime",
                                error = %e,
                                "could not ack timer item; redelivery will yield a duplicate fire"
                            );
                        }
                    }
                    Err(e) => {
                        // Leave the item locked; expiry redelivers it.
                        warn!(
                            target: "duratask::runtime",
                            error = %e,
                            "could not enqueue timer fire; waiting for redelivery"
                        );
                    }
                }
            }
            other => {
                error!(
                    target: "duratask::runtime",
                    kind = kind_of(&other),
                    "unexpected item on timer queue; dropping"
                );
                if let Err(e) = self.store.ack_timer_item(token).await {
                    warn!(
                        target: "duratask::runtime",
                        error = %e,
                        "could not drop misrouted timer item"
                    );
                }
            }
        }
    }
}
