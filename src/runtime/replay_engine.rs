//! Folds a delivered message batch into history and runs one replay turn.
//!
//! The engine is the validation point between the at-least-once queue world
//! and the exactly-once history world: stale and duplicate completions are
//! dropped here, completions that do not line up with a recorded schedule
//! fail the instance as nondeterministic, and orchestrator panics are caught
//! and persisted as failures instead of taking the dispatcher down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::providers::WorkItem;
use crate::runtime::{kind_of, panic_text, OrchestrationHandler};
use crate::{Action, ErrorDetails, Event};

/// Outcome of one orchestration turn.
#[derive(Debug)]
pub enum TurnResult {
    /// Still running; pending actions need dispatch.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String, version: Option<String> },
    /// A cancel request was observed and the turn did not override it.
    Cancelled(String),
}

/// Single-use executor for one instance turn: fold completions, replay, emit
/// a history delta plus pending actions for the dispatcher to commit.
pub struct ReplayEngine {
    instance: String,
    execution_id: u64,
    baseline_history: Vec<Event>,
    history_delta: Vec<Event>,
    pending_actions: Vec<Action>,
    /// First batch-level validation failure; aborts the turn before user code.
    abort_error: Option<ErrorDetails>,
}

impl ReplayEngine {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        Self {
            instance,
            execution_id,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            abort_error: None,
        }
    }

    /// Seed the `OrchestrationStarted` event of a fresh execution. Must run
    /// before [`prep_completions`](Self::prep_completions).
    pub fn seed_started(&mut self, event: Event) {
        debug_assert!(self.baseline_history.is_empty() && self.history_delta.is_empty());
        self.history_delta.push(event);
    }

    /// Stage 1: fold the delivered batch into completion events.
    ///
    /// The batch is folded in ascending correlation-id order so the relative
    /// position of same-batch completions in history is stable, which is what
    /// `when_all`/`when_any` tie-breaking keys on. Id-less messages (external
    /// raises, cancellation) keep arrival order after the rest.
    pub fn prep_completions(&mut self, mut messages: Vec<WorkItem>) {
        debug!(
            target: "duratask::runtime",
            instance = %self.instance,
            message_count = messages.len(),
            "folding completion batch into history"
        );
        messages.sort_by_key(completion_sort_key);

        for msg in messages {
            if !self.is_for_current_execution(&msg) {
                warn!(
                    target: "duratask::runtime",
                    instance = %self.instance,
                    kind = kind_of(&msg),
                    execution_id = self.execution_id,
                    "dropping stale or misrouted message"
                );
                continue;
            }

            if let Some(id) = completion_correlation_id(&msg) {
                if self.completion_exists(id) {
                    warn!(
                        target: "duratask::runtime",
                        instance = %self.instance,
                        id,
                        kind = kind_of(&msg),
                        "dropping duplicate completion"
                    );
                    continue;
                }
                if let Some(err) = self.match_schedule(id, &msg) {
                    warn!(
                        target: "duratask::runtime",
                        instance = %self.instance,
                        error = %err,
                        "completion does not match recorded schedule"
                    );
                    if self.abort_error.is_none() {
                        self.abort_error = Some(err);
                    }
                    continue;
                }
            }

            let event = match msg {
                WorkItem::ActivityCompleted { id, result, .. } => {
                    Some(Event::ActivityCompleted { id, result })
                }
                WorkItem::ActivityFailed { id, details, .. } => {
                    // Failures fold like any completion; the awaiting future
                    // surfaces them to orchestrator code as `Err`.
                    Some(Event::ActivityFailed { id, details })
                }
                WorkItem::TimerFired { id, fire_at_ms, .. } => {
                    Some(Event::TimerFired { id, fire_at_ms })
                }
                WorkItem::SubOrchCompleted { parent_id, result, .. } => {
                    Some(Event::SubOrchestrationCompleted { id: parent_id, result })
                }
                WorkItem::SubOrchFailed { parent_id, details, .. } => {
                    Some(Event::SubOrchestrationFailed { id: parent_id, details })
                }
                WorkItem::ExternalRaised { name, data, .. } => {
                    // Bind the raise to the oldest unsatisfied subscription of
                    // this name; with none, the raise is dropped (subscribing
                    // after the fact does not resurrect it).
                    match self.unsatisfied_subscription(&name) {
                        Some(id) => Some(Event::ExternalEvent { id, name, data }),
                        None => {
                            warn!(
                                target: "duratask::runtime",
                                instance = %self.instance,
                                event_name = %name,
                                "dropping external event with no live subscription"
                            );
                            None
                        }
                    }
                }
                WorkItem::CancelInstance { reason, .. } => {
                    let already_requested = self
                        .baseline_history
                        .iter()
                        .chain(self.history_delta.iter())
                        .any(|e| matches!(e, Event::OrchestrationCancelRequested { .. }));
                    if already_requested {
                        None
                    } else {
                        Some(Event::OrchestrationCancelRequested { reason })
                    }
                }
                _ => None,
            };

            if let Some(event) = event {
                self.history_delta.push(event);
            }
        }
    }

    /// Stage 2: replay the orchestrator over baseline + folded completions.
    pub fn execute(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(details) = self.abort_error.take() {
            error!(
                target: "duratask::runtime",
                instance = %self.instance,
                error = %details,
                "aborting turn: completion batch contradicts history"
            );
            return TurnResult::Failed(details);
        }

        let baseline_len = self.baseline_history.len();
        let turn_index = self
            .baseline_history
            .iter()
            .filter(|e| e.completion_id().is_some())
            .count() as u64
            + 1;
        let working_len = baseline_len + self.history_delta.len();
        let mut working_history = self.baseline_history.clone();
        working_history.extend(self.history_delta.iter().cloned());

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_with_claims(working_history, turn_index, baseline_len, move |ctx| {
                let handler = Arc::clone(&handler);
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            })
        }));

        let (updated_history, actions, output, claims) = match run_result {
            Ok(turn) => turn,
            Err(payload) => {
                let msg = panic_text(payload);
                warn!(
                    target: "duratask::runtime",
                    instance = %self.instance,
                    error = %msg,
                    "orchestrator panicked; recording failure"
                );
                return TurnResult::Failed(ErrorDetails::logic(format!(
                    "orchestration panicked: {msg}"
                )));
            }
        };

        if let Some(msg) = claims.nondeterminism {
            error!(
                target: "duratask::runtime",
                instance = %self.instance,
                error = %msg,
                "replay diverged from recorded history; failing instance"
            );
            return TurnResult::Failed(ErrorDetails::nondeterminism(msg));
        }

        if updated_history.len() > working_len {
            self.history_delta
                .extend(updated_history[working_len..].iter().cloned());
        }
        self.pending_actions = actions;

        // Cancellation wins over any outcome produced in the same turn.
        let cancel_reason = self
            .baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .find_map(|e| match e {
                Event::OrchestrationCancelRequested { reason } => Some(reason.clone()),
                _ => None,
            });
        if let Some(reason) = cancel_reason {
            return TurnResult::Cancelled(reason);
        }

        for action in &self.pending_actions {
            if let Action::ContinueAsNew { input, version } = action {
                return TurnResult::ContinueAsNew {
                    input: input.clone(),
                    version: version.clone(),
                };
            }
        }

        if let Some(output) = output {
            // A finished run must have accounted for every recorded schedule;
            // unclaimed ones mean the code path changed since recording.
            if !claims.leftover_schedules.is_empty() {
                let msg = format!(
                    "history records schedules the code never issued: {}",
                    claims.leftover_schedules.join(", ")
                );
                error!(
                    target: "duratask::runtime",
                    instance = %self.instance,
                    error = %msg,
                    "replay diverged from recorded history; failing instance"
                );
                return TurnResult::Failed(ErrorDetails::nondeterminism(msg));
            }
            return match output {
                Ok(result) => TurnResult::Completed(result),
                Err(error) => {
                    if error.starts_with("timeout:") {
                        TurnResult::Failed(ErrorDetails::timeout(error))
                    } else {
                        TurnResult::Failed(ErrorDetails::logic(error))
                    }
                }
            };
        }

        TurnResult::Continue
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    /// Consume the engine, yielding the history delta to persist and the
    /// actions to dispatch.
    pub fn into_changes(self) -> (Vec<Event>, Vec<Action>) {
        (self.history_delta, self.pending_actions)
    }

    fn is_for_current_execution(&self, msg: &WorkItem) -> bool {
        match msg {
            WorkItem::ActivityCompleted { execution_id, .. }
            | WorkItem::ActivityFailed { execution_id, .. }
            | WorkItem::TimerFired { execution_id, .. } => *execution_id == self.execution_id,
            WorkItem::SubOrchCompleted {
                parent_execution_id, ..
            }
            | WorkItem::SubOrchFailed {
                parent_execution_id, ..
            } => *parent_execution_id == self.execution_id,
            WorkItem::ExternalRaised { .. } | WorkItem::CancelInstance { .. } => true,
            _ => false,
        }
    }

    fn completion_exists(&self, id: u64) -> bool {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .any(|e| e.completion_id() == Some(id))
    }

    /// Verify `msg` completes a schedule recorded under `id` with the right
    /// kind. Returns the nondeterminism error to abort with on mismatch.
    fn match_schedule(&self, id: u64, msg: &WorkItem) -> Option<ErrorDetails> {
        let expected = match msg {
            WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. } => "activity",
            WorkItem::TimerFired { .. } => "timer",
            WorkItem::SubOrchCompleted { .. } | WorkItem::SubOrchFailed { .. } => "suborchestration",
            _ => return None,
        };
        let recorded = self
            .baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .find(|e| e.schedule_id() == Some(id))
            .and_then(|e| e.schedule_kind());
        match recorded {
            Some(kind) if kind == expected => None,
            Some(kind) => Some(ErrorDetails::nondeterminism(format!(
                "completion kind mismatch for id={id}: history scheduled '{kind}' but completion is '{expected}'"
            ))),
            None => Some(ErrorDetails::nondeterminism(format!(
                "no matching schedule for completion id={id} ('{expected}')"
            ))),
        }
    }

    /// Oldest subscription for `name` with no delivered event yet.
    fn unsatisfied_subscription(&self, name: &str) -> Option<u64> {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .filter_map(|e| match e {
                Event::ExternalSubscribed { id, name: n } if n == name => Some(*id),
                _ => None,
            })
            .find(|id| {
                !self
                    .baseline_history
                    .iter()
                    .chain(self.history_delta.iter())
                    .any(|e| matches!(e, Event::ExternalEvent { id: eid, .. } if eid == id))
            })
    }
}

fn completion_sort_key(msg: &WorkItem) -> u64 {
    completion_correlation_id(msg).unwrap_or(u64::MAX)
}

fn completion_correlation_id(msg: &WorkItem) -> Option<u64> {
    match msg {
        WorkItem::ActivityCompleted { id, .. }
        | WorkItem::ActivityFailed { id, .. }
        | WorkItem::TimerFired { id, .. } => Some(*id),
        WorkItem::SubOrchCompleted { parent_id, .. } | WorkItem::SubOrchFailed { parent_id, .. } => {
            Some(*parent_id)
        }
        _ => None,
    }
}

#[path = "replay_engine_tests.rs"]
mod replay_engine_tests;
