//! Orchestration dispatcher: concurrent workers fetching instance batches
//! under peek-lock and processing them through the replay engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::runtime::Runtime;

impl Runtime {
    /// Spawn the orchestration dispatcher. Instance locks in the provider keep
    /// concurrent workers off the same instance, so concurrency here only
    /// bounds how many distinct instances progress at once.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency;

        tokio::spawn(async move {
            let mut workers = Vec::new();

            for _ in 0..concurrency {
                let rt = Arc::clone(&self);
                workers.push(tokio::spawn(async move {
                    loop {
                        if rt.is_shutdown() {
                            break;
                        }

                        match rt
                            .store
                            .fetch_orchestration_item(rt.options.orchestration_lock_timeout)
                            .await
                        {
                            Ok(Some(item)) => {
                                rt.process_orchestration_item(item).await;
                            }
                            Ok(None) => {
                                rt.idle_sleep().await;
                            }
                            Err(e) => {
                                warn!(
                                    target: "duratask::runtime",
                                    error = %e,
                                    "error fetching orchestration item"
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
}
