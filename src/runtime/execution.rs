//! Drives one fetched orchestration item end to end: classify the batch,
//! resolve the handler version, run the replay engine, translate pending
//! actions into queue work, and commit history plus dispatch in a single ack.

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tracing::{debug, warn};

use crate::providers::{OrchestrationItem, ProviderError, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::{OrchestrationHandler, Runtime};
use crate::{Action, ErrorDetails, Event};

/// Name, version, and input recorded by the execution's first event.
fn started_fields(history: &[Event]) -> Option<(String, String, String)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted {
            name, version, input, ..
        } => Some((name.clone(), version.clone(), input.clone())),
        _ => None,
    })
}

fn parent_link(history: &[Event]) -> Option<(String, u64)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted {
            parent_instance: Some(pi),
            parent_id: Some(pid),
            ..
        } => Some((pi.clone(), *pid)),
        _ => None,
    })
}

impl Runtime {
    pub(in crate::runtime) async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let OrchestrationItem {
            instance,
            lock_token,
            execution_id,
            history,
            messages,
        } = item;

        // Split the batch: at most one start-ish message decides how this
        // execution boots, everything else folds in as completions.
        let mut start_msg: Option<WorkItem> = None;
        let mut can_msg: Option<WorkItem> = None;
        let mut completions: Vec<WorkItem> = Vec::new();
        for msg in messages {
            match msg {
                WorkItem::StartOrchestration { .. } => {
                    if start_msg.is_some() || !history.is_empty() {
                        warn!(
                            target: "duratask::runtime",
                            instance = %instance,
                            "ignoring start for an instance that already exists"
                        );
                    } else {
                        start_msg = Some(msg);
                    }
                }
                WorkItem::ContinueAsNew { .. } => {
                    if can_msg.is_some() {
                        warn!(
                            target: "duratask::runtime",
                            instance = %instance,
                            "ignoring duplicate continue-as-new message"
                        );
                    } else {
                        can_msg = Some(msg);
                    }
                }
                other => completions.push(other),
            }
        }

        // Terminal instances consume their stragglers without processing.
        // ContinuedAsNew is only terminal for the OLD execution; the matching
        // rollover message boots the next one.
        let continued_as_new = matches!(history.last(), Some(Event::OrchestrationContinuedAsNew { .. }));
        let last_terminal = history.last().map_or(false, Event::is_terminal);
        if last_terminal && !(continued_as_new && can_msg.is_some()) {
            debug!(
                target: "duratask::runtime",
                instance = %instance,
                execution_id,
                "dropping batch delivered to a terminal instance"
            );
            let _ = self
                .ack_orchestration_with_changes(&lock_token, execution_id, vec![], vec![], vec![], vec![])
                .await;
            return;
        }

        if let Some(WorkItem::ContinueAsNew {
            orchestration,
            input,
            version,
            ..
        }) = can_msg
        {
            // Roll over to a fresh execution. The parent link survives the
            // rollover so the final execution still notifies the parent.
            let parent = parent_link(&history);
            let next_execution_id = execution_id + 1;
            match self.resolve_for_start(&orchestration, version.as_deref()) {
                Ok((resolved, handler)) => {
                    let seed = Event::OrchestrationStarted {
                        name: orchestration.clone(),
                        version: resolved.to_string(),
                        input: input.clone(),
                        parent_instance: parent.as_ref().map(|(p, _)| p.clone()),
                        parent_id: parent.as_ref().map(|(_, id)| *id),
                    };
                    self.run_and_commit(
                        &instance,
                        &lock_token,
                        next_execution_id,
                        Vec::new(),
                        Some(seed),
                        completions,
                        handler,
                        &orchestration,
                        input,
                        parent,
                    )
                    .await;
                }
                Err(details) => {
                    let seed = Event::OrchestrationStarted {
                        name: orchestration.clone(),
                        version: "0.0.0".to_string(),
                        input,
                        parent_instance: parent.as_ref().map(|(p, _)| p.clone()),
                        parent_id: parent.as_ref().map(|(_, id)| *id),
                    };
                    self.commit_boot_failure(&lock_token, &instance, next_execution_id, Some(seed), details, parent)
                        .await;
                }
            }
            return;
        }

        if history.is_empty() {
            let Some(WorkItem::StartOrchestration {
                orchestration,
                input,
                version,
                parent_instance,
                parent_id,
                ..
            }) = start_msg
            else {
                // Completions for an instance that was never started have
                // nothing to bind to.
                warn!(
                    target: "duratask::runtime",
                    instance = %instance,
                    "dropping batch for unknown instance with no start message"
                );
                let _ = self
                    .ack_orchestration_with_changes(&lock_token, execution_id, vec![], vec![], vec![], vec![])
                    .await;
                return;
            };
            let parent = parent_instance.zip(parent_id);
            match self.resolve_for_start(&orchestration, version.as_deref()) {
                Ok((resolved, handler)) => {
                    let seed = Event::OrchestrationStarted {
                        name: orchestration.clone(),
                        version: resolved.to_string(),
                        input: input.clone(),
                        parent_instance: parent.as_ref().map(|(p, _)| p.clone()),
                        parent_id: parent.as_ref().map(|(_, id)| *id),
                    };
                    self.run_and_commit(
                        &instance,
                        &lock_token,
                        execution_id,
                        Vec::new(),
                        Some(seed),
                        completions,
                        handler,
                        &orchestration,
                        input,
                        parent,
                    )
                    .await;
                }
                Err(details) => {
                    let seed = Event::OrchestrationStarted {
                        name: orchestration.clone(),
                        version: "0.0.0".to_string(),
                        input,
                        parent_instance: parent.as_ref().map(|(p, _)| p.clone()),
                        parent_id: parent.as_ref().map(|(_, id)| *id),
                    };
                    self.commit_boot_failure(&lock_token, &instance, execution_id, Some(seed), details, parent)
                        .await;
                }
            }
            return;
        }

        // Resume: identity comes from the recorded start event, and the
        // pinned version must resolve exactly so upgrades never rewrite
        // in-flight replays.
        let parent = parent_link(&history);
        let Some((name, version_str, input)) = started_fields(&history) else {
            self.commit_boot_failure(
                &lock_token,
                &instance,
                execution_id,
                None,
                ErrorDetails::logic("history has no OrchestrationStarted event"),
                parent,
            )
            .await;
            return;
        };
        let handler = Version::parse(&version_str)
            .ok()
            .and_then(|v| self.orchestration_registry.resolve_handler_exact(&name, &v));
        match handler {
            Some(handler) => {
                self.run_and_commit(
                    &instance,
                    &lock_token,
                    execution_id,
                    history,
                    None,
                    completions,
                    handler,
                    &name,
                    input,
                    parent,
                )
                .await;
            }
            None => {
                self.commit_boot_failure(
                    &lock_token,
                    &instance,
                    execution_id,
                    None,
                    ErrorDetails::logic(format!("unregistered orchestration version: {name}@{version_str}")),
                    parent,
                )
                .await;
            }
        }
    }

    /// Resolve a handler for a new execution: explicit version exactly,
    /// otherwise through the registry's version policy.
    fn resolve_for_start(
        &self,
        name: &str,
        explicit_version: Option<&str>,
    ) -> Result<(Version, Arc<dyn OrchestrationHandler>), ErrorDetails> {
        let resolved = match explicit_version {
            Some(v_str) => match Version::parse(v_str) {
                Ok(v) => self
                    .orchestration_registry
                    .resolve_handler_exact(name, &v)
                    .map(|h| (v, h)),
                Err(_) => None,
            },
            None => self.orchestration_registry.resolve_handler(name),
        };
        resolved.ok_or_else(|| {
            let qualified = match explicit_version {
                Some(v) => format!("{name}@{v}"),
                None => name.to_string(),
            };
            ErrorDetails::logic(format!("unregistered orchestration: {qualified}"))
        })
    }

    /// Run the replay engine over one batch and commit the outcome.
    #[allow(clippy::too_many_arguments)]
    async fn run_and_commit(
        self: &Arc<Self>,
        instance: &str,
        lock_token: &str,
        execution_id: u64,
        baseline: Vec<Event>,
        seed: Option<Event>,
        completions: Vec<WorkItem>,
        handler: Arc<dyn OrchestrationHandler>,
        name: &str,
        input: String,
        parent: Option<(String, u64)>,
    ) {
        let mut engine = ReplayEngine::new(instance.to_string(), execution_id, baseline);
        if let Some(event) = seed {
            engine.seed_started(event);
        }
        engine.prep_completions(completions);
        let result = engine.execute(handler, input);
        let made_progress = engine.made_progress();
        let (mut delta, actions) = engine.into_changes();

        let mut worker_items = Vec::new();
        let mut timer_items = Vec::new();
        let mut orchestrator_items = Vec::new();

        match result {
            TurnResult::Continue => {
                if !made_progress {
                    // Every message in the batch folded to nothing (stale or
                    // duplicate); the ack below just releases the lock.
                    debug!(
                        target: "duratask::runtime",
                        instance = %instance,
                        execution_id,
                        "turn made no progress"
                    );
                }
                for action in actions {
                    match action {
                        Action::CallActivity {
                            id,
                            name,
                            input,
                            attempt,
                        } => worker_items.push(WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            name,
                            input,
                            attempt,
                        }),
                        Action::CreateTimer { id, fire_at_ms } => timer_items.push(WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            fire_at_ms,
                        }),
                        Action::StartSubOrchestration {
                            id,
                            name,
                            version,
                            instance: child_suffix,
                            input,
                        } => {
                            // Child instance ids nest under the parent.
                            orchestrator_items.push(WorkItem::StartOrchestration {
                                instance: format!("{instance}::{child_suffix}"),
                                orchestration: name,
                                input,
                                version,
                                parent_instance: Some(instance.to_string()),
                                parent_id: Some(id),
                            });
                        }
                        // Subscriptions live purely in history; raises find
                        // them there.
                        Action::WaitExternal { .. } => {}
                        // Plucked by the engine before it returns Continue.
                        Action::ContinueAsNew { .. } => {}
                    }
                }
            }
            TurnResult::Completed(output) => {
                debug!(
                    target: "duratask::runtime",
                    instance = %instance,
                    execution_id,
                    orchestration = %name,
                    "orchestration completed"
                );
                delta.push(Event::OrchestrationCompleted {
                    output: output.clone(),
                });
                if let Some((parent_instance, parent_id)) = parent {
                    orchestrator_items.push(
                        self.child_result_to_parent(parent_instance, parent_id, Ok(output))
                            .await,
                    );
                }
            }
            TurnResult::Failed(details) => {
                warn!(
                    target: "duratask::runtime",
                    instance = %instance,
                    execution_id,
                    orchestration = %name,
                    error = %details,
                    "orchestration failed"
                );
                delta.push(Event::OrchestrationFailed {
                    details: details.clone(),
                });
                if let Some((parent_instance, parent_id)) = parent {
                    orchestrator_items.push(
                        self.child_result_to_parent(parent_instance, parent_id, Err(details))
                            .await,
                    );
                }
            }
            TurnResult::ContinueAsNew { input, version } => {
                debug!(
                    target: "duratask::runtime",
                    instance = %instance,
                    execution_id,
                    orchestration = %name,
                    "orchestration continuing as new"
                );
                delta.push(Event::OrchestrationContinuedAsNew { input: input.clone() });
                orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.to_string(),
                    orchestration: name.to_string(),
                    input,
                    version,
                });
            }
            TurnResult::Cancelled(reason) => {
                warn!(
                    target: "duratask::runtime",
                    instance = %instance,
                    execution_id,
                    orchestration = %name,
                    reason = %reason,
                    "orchestration terminated"
                );
                delta.push(Event::OrchestrationTerminated {
                    reason: reason.clone(),
                });
                if let Some((parent_instance, parent_id)) = parent {
                    let details = ErrorDetails::terminated(format!("sub-orchestration terminated: {reason}"));
                    orchestrator_items.push(
                        self.child_result_to_parent(parent_instance, parent_id, Err(details))
                            .await,
                    );
                }
            }
        }

        let _ = self
            .ack_orchestration_with_changes(
                lock_token,
                execution_id,
                delta,
                worker_items,
                timer_items,
                orchestrator_items,
            )
            .await;
    }

    /// Fail an execution before its handler ever runs (unregistered name or
    /// version, corrupt history).
    async fn commit_boot_failure(
        self: &Arc<Self>,
        lock_token: &str,
        instance: &str,
        execution_id: u64,
        seed: Option<Event>,
        details: ErrorDetails,
        parent: Option<(String, u64)>,
    ) {
        warn!(
            target: "duratask::runtime",
            instance = %instance,
            execution_id,
            error = %details,
            "failing orchestration before execution"
        );
        let mut delta: Vec<Event> = seed.into_iter().collect();
        delta.push(Event::OrchestrationFailed {
            details: details.clone(),
        });
        let mut orchestrator_items = Vec::new();
        if let Some((parent_instance, parent_id)) = parent {
            orchestrator_items.push(
                self.child_result_to_parent(parent_instance, parent_id, Err(details))
                    .await,
            );
        }
        let _ = self
            .ack_orchestration_with_changes(lock_token, execution_id, delta, vec![], vec![], orchestrator_items)
            .await;
    }

    /// Package a child's terminal result as a completion for its parent,
    /// addressed to the parent's current execution.
    async fn child_result_to_parent(
        &self,
        parent_instance: String,
        parent_id: u64,
        result: Result<String, ErrorDetails>,
    ) -> WorkItem {
        let parent_execution_id = self
            .store
            .latest_execution_id(&parent_instance)
            .await
            .ok()
            .flatten()
            .unwrap_or(1);
        match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance,
                parent_execution_id,
                parent_id,
                result,
            },
            Err(details) => WorkItem::SubOrchFailed {
                parent_instance,
                parent_execution_id,
                parent_id,
                details,
            },
        }
    }

    /// Commit a turn with bounded retries; abandons the batch for redelivery
    /// if the store stays unavailable.
    pub(in crate::runtime) async fn ack_orchestration_with_changes(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        loop {
            match self
                .store
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    orchestrator_items.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < 5 => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(
                        target: "duratask::runtime",
                        attempts,
                        backoff_ms,
                        error = %e,
                        "ack_orchestration_item failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(
                        target: "duratask::runtime",
                        attempts,
                        error = %e,
                        "could not commit orchestration turn; abandoning batch for redelivery"
                    );
                    if let Err(abandon_err) = self.store.abandon_orchestration_item(lock_token, Some(50)).await {
                        warn!(
                            target: "duratask::runtime",
                            error = %abandon_err,
                            "abandon after failed ack also failed; lock will expire on its own"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
