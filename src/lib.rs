//! Durable workflow orchestration with deterministic replay.
//!
//! An orchestration is ordinary async Rust driven by an [`OrchestrationContext`].
//! Every durable operation the orchestrator issues (activity call, timer,
//! external-event subscription, sub-orchestration) is assigned a correlation id
//! in issuance order and recorded in an append-only per-instance history. When
//! new completions arrive, the orchestrator function is re-executed from the
//! top over that history: operations whose scheduled events already exist adopt
//! them instead of re-emitting commands, completions resolve the corresponding
//! futures, and execution continues deterministically from where it left off.
//! A process crash therefore loses nothing but in-flight CPU time.
//!
//! The crate splits into:
//! - this module: the event/action model, the single-turn replay executor, and
//!   the durable futures ([`DurableFuture`] and its `join`/`select`/`when_all`/
//!   `when_any` aggregates),
//! - [`runtime`]: dispatcher loops that drive instances against a [`providers::Provider`],
//! - [`client`]: the control plane (start, raise, cancel, status, wait),
//! - [`providers`]: durable history + queue backends (in-memory, sqlite).
//!
//! Orchestrator code must be replay-safe: no wall clock, randomness, or I/O
//! outside durable operations. Logging inside orchestrations goes through the
//! replay-gated [`durable_info!`]/[`durable_warn!`]/[`durable_error!`] macros.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use crate::_typed_codec::{Codec, Json};

mod futures;
pub mod client;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::Client;
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture, WhenAllFuture};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
pub use runtime::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler, OrchestrationStatus};

/// Classification for persisted failures. See [`ErrorDetails`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// An activity handler returned an error (or could not be resolved).
    Activity,
    /// Orchestrator code returned an error or panicked.
    OrchestratorLogic,
    /// Replay produced a different operation sequence than history recorded.
    /// Fatal for the instance; never retried or fixed up.
    Nondeterminism,
    /// A retry loop exhausted its overall deadline.
    Timeout,
    /// The instance was cancelled on explicit request.
    Terminated,
    /// A provider/transport fault was surfaced after retry exhaustion.
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Activity => "activity",
            ErrorKind::OrchestratorLogic => "orchestrator",
            ErrorKind::Nondeterminism => "nondeterminism",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Terminated => "terminated",
            ErrorKind::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Structured failure payload persisted in history and surfaced through status
/// queries. Orchestrator-facing futures flatten this to the display message;
/// the full structure is what status callers observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number for activity failures (1-based).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorDetails {
    pub fn activity(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: ErrorKind::Activity,
            message: message.into(),
            attempt: Some(attempt),
            retryable: true,
        }
    }

    /// Activity failure that retrying cannot fix (e.g. unregistered name).
    pub fn activity_permanent(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: ErrorKind::Activity,
            message: message.into(),
            attempt: Some(attempt),
            retryable: false,
        }
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::OrchestratorLogic,
            message: message.into(),
            attempt: None,
            retryable: false,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Nondeterminism,
            message: message.into(),
            attempt: None,
            retryable: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
            attempt: None,
            retryable: false,
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminated,
            message: reason.into(),
            attempt: None,
            retryable: false,
        }
    }

    pub fn infrastructure(operation: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: ErrorKind::Infrastructure,
            message: format!("{operation}: {}", message.into()),
            attempt: None,
            retryable,
        }
    }

    /// The message orchestrator code sees when awaiting a failed operation.
    pub fn display_message(&self) -> String {
        self.message.clone()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One record in an instance's append-only history. Correlation ids (`id`)
/// are assigned in issuance order per execution and tie a scheduled operation
/// to its completion; the id, not name/input (which may repeat), is the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// First event of every execution; carries the resolved handler version.
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_instance: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        id: u64,
        result: String,
    },
    ActivityFailed {
        id: u64,
        details: ErrorDetails,
    },
    TimerCreated {
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        id: u64,
        name: String,
    },
    ExternalEvent {
        id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        id: u64,
        details: ErrorDetails,
    },
    /// Terminal for the current execution; a successor execution follows.
    OrchestrationContinuedAsNew {
        input: String,
    },
    /// Injected by an explicit cancel request; not itself terminal.
    OrchestrationCancelRequested {
        reason: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationTerminated {
        reason: String,
    },
}

impl Event {
    /// True for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
                | Event::OrchestrationContinuedAsNew { .. }
        )
    }

    /// Correlation id of a scheduled-operation event.
    pub(crate) fn schedule_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::ExternalSubscribed { id, .. }
            | Event::SubOrchestrationScheduled { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Kind tag of a scheduled-operation event, used for completion matching.
    pub(crate) fn schedule_kind(&self) -> Option<&'static str> {
        match self {
            Event::ActivityScheduled { .. } => Some("activity"),
            Event::TimerCreated { .. } => Some("timer"),
            Event::ExternalSubscribed { .. } => Some("external"),
            Event::SubOrchestrationScheduled { .. } => Some("suborchestration"),
            _ => None,
        }
    }

    /// Correlation id of a completion event.
    pub(crate) fn completion_id(&self) -> Option<u64> {
        match self {
            Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerFired { id, .. }
            | Event::ExternalEvent { id, .. }
            | Event::SubOrchestrationCompleted { id, .. }
            | Event::SubOrchestrationFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Short human description for diagnostics.
    pub(crate) fn describe(&self) -> String {
        match self {
            Event::ActivityScheduled { id, name, .. } => format!("ActivityScheduled(id={id}, name='{name}')"),
            Event::TimerCreated { id, .. } => format!("TimerCreated(id={id})"),
            Event::ExternalSubscribed { id, name } => format!("ExternalSubscribed(id={id}, name='{name}')"),
            Event::SubOrchestrationScheduled { id, name, .. } => {
                format!("SubOrchestrationScheduled(id={id}, name='{name}')")
            }
            other => format!("{other:?}"),
        }
    }
}

/// Commands a replay turn asks the dispatcher to make durable. Emitting these
/// is the replay engine's only side effect; persistence and dispatch belong to
/// the dispatcher, committed atomically with the history delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    CallActivity {
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    CreateTimer {
        id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        id: u64,
        name: String,
    },
    StartSubOrchestration {
        id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    /// Working history: baseline from prior turns, completions folded in for
    /// this turn, plus scheduled events appended by fresh issuances.
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) turn_index: u64,
    /// History length before this turn's delivery was folded in. Indices at or
    /// past this point are new information; touching one ends replay mode.
    pub(crate) baseline_len: usize,
    pub(crate) touched_new: bool,
    pub(crate) claimed_ids: HashSet<u64>,
    pub(crate) claimed_indices: HashSet<usize>,
    pub(crate) consumed_indices: HashSet<usize>,
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>, turn_index: u64, baseline_len: usize) -> Self {
        Self {
            history,
            actions: Vec::new(),
            turn_index,
            baseline_len,
            touched_new: false,
            claimed_ids: HashSet::new(),
            claimed_indices: HashSet::new(),
            consumed_indices: HashSet::new(),
            nondeterminism: None,
        }
    }

    /// Next correlation id: one past the highest id seen in the working history.
    pub(crate) fn next_correlation_id(&self) -> u64 {
        self.history
            .iter()
            .filter_map(|e| e.schedule_id().or_else(|| e.completion_id()))
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Index of the schedule frontier: the first scheduled event no future has
    /// claimed yet. Issuance must line up with this, in order.
    pub(crate) fn next_unclaimed_schedule(&self) -> Option<usize> {
        self.history
            .iter()
            .enumerate()
            .find(|(i, e)| e.schedule_id().is_some() && !self.claimed_indices.contains(i))
            .map(|(i, _)| i)
    }

    pub(crate) fn claim(&mut self, index: usize, id: u64) {
        self.claimed_indices.insert(index);
        self.claimed_ids.insert(id);
        if index >= self.baseline_len {
            self.touched_new = true;
        }
    }

    pub(crate) fn consume(&mut self, index: usize) {
        self.consumed_indices.insert(index);
        if index >= self.baseline_len {
            self.touched_new = true;
        }
    }

    pub(crate) fn record_nondeterminism(&mut self, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    fn leftover_schedules(&self) -> Vec<String> {
        self.history
            .iter()
            .enumerate()
            .filter(|(i, e)| e.schedule_id().is_some() && !self.claimed_indices.contains(i))
            .map(|(_, e)| e.describe())
            .collect()
    }
}

/// Handle threaded through orchestrator code; the only door to durable
/// operations. Exposes no wall clock and no randomness: anything
/// nondeterministic must round-trip through history as an event.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Context over a full history, treated entirely as baseline. Turn-driving
    /// code uses the crate-internal constructor to mark the delivery boundary.
    pub fn new(history: Vec<Event>) -> Self {
        let baseline = history.len();
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, 0, baseline))),
        }
    }

    pub(crate) fn for_turn(history: Vec<Event>, turn_index: u64, baseline_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, turn_index, baseline_len))),
        }
    }

    /// Schedule a named activity. Resolves to `DurableOutput::Activity` with
    /// the handler's result. Nothing is recorded until first poll.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), 1)
    }

    /// [`Self::schedule_activity`] with a serialized payload. Await the result
    /// through [`DurableFuture::into_activity_typed`]. Panics if `input` does
    /// not serialize; the panic fails the orchestration deterministically.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name = name.into();
        let payload = match Json::encode(input) {
            Ok(p) => p,
            Err(e) => panic!("serialize input for activity '{name}': {e}"),
        };
        DurableFuture::activity(self.clone(), name, payload, 1)
    }

    pub(crate) fn schedule_activity_attempt(&self, name: &str, input: &str, attempt: u32) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.to_string(), input.to_string(), attempt)
    }

    /// Durable timer. The fire time is stamped once, when the timer is first
    /// issued, and read back from history on every replay.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay.as_millis() as u64)
    }

    /// Subscribe to a named external event; resolves when a matching raise is
    /// folded into history.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Schedule a child orchestration. The child gets its own instance id
    /// (`{parent}::sub::{correlation_id}`) and history; its terminal result is
    /// delivered back as this future's resolution.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), None, input.into())
    }

    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), Some(version.into()), input.into())
    }

    /// [`Self::schedule_sub_orchestration`] with a serialized payload. Panics
    /// if `input` does not serialize, failing the orchestration
    /// deterministically.
    pub fn schedule_sub_orchestration_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name = name.into();
        let payload = match Json::encode(input) {
            Ok(p) => p,
            Err(e) => panic!("serialize input for sub-orchestration '{name}': {e}"),
        };
        DurableFuture::sub_orchestration(self.clone(), name, None, payload)
    }

    /// End the current execution and restart it with fresh history and the
    /// given input. Takes precedence over any value the orchestrator returns
    /// in the same turn.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let input = input.into();
        inner.actions.push(Action::ContinueAsNew { input, version: None });
    }

    pub fn continue_as_new_versioned(&self, input: impl Into<String>, version: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.actions.push(Action::ContinueAsNew {
            input: input.into(),
            version: Some(version.into()),
        });
    }

    /// All constituents, outputs in issuance order (not completion order).
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(self.clone(), futures)
    }

    /// First constituent to complete, by completion arrival order in history;
    /// ties within one delivery batch resolve to the lowest correlation id.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Fan-in with fail-fast: resolves `Err` with the earliest-observed
    /// failure as soon as any constituent has failed, `Ok(results)` in
    /// issuance order once every constituent succeeded. Straggler completions
    /// for unobserved siblings still land in history when they arrive.
    pub fn when_all(&self, futures: Vec<DurableFuture>) -> WhenAllFuture {
        WhenAllFuture::new(self.clone(), futures)
    }

    /// Alias of [`OrchestrationContext::select`] for fan-out races.
    pub fn when_any(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        self.select(futures)
    }

    /// Activity call wrapped in the durable retry loop: attempt `n` waits
    /// `policy.delay_for_attempt(n)` on a durable timer before rescheduling.
    /// Gives up when attempts are exhausted or the overall deadline passes,
    /// surfacing an ordinary awaited-future failure.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        retry::run_retry_loop(self, &policy, |attempt| {
            self.schedule_activity_attempt(&name, &input, attempt).into_activity()
        })
        .await
    }

    /// Sub-orchestration flavor of the durable retry loop.
    pub async fn schedule_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        retry::run_retry_loop(self, &policy, |_attempt| {
            self.schedule_sub_orchestration(name.clone(), input.clone())
                .into_sub_orchestration()
        })
        .await
    }

    /// True while this turn is re-running code the instance already executed.
    /// Replay-gated logging keys off this.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.baseline_len > 0 && !inner.touched_new
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }

    /// Replay-safe info log; suppressed on replayed passes.
    pub fn trace_info(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::info!(target: "duratask::orchestration", turn_idx = self.turn_index(), "{}", message.as_ref());
        }
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::warn!(target: "duratask::orchestration", turn_idx = self.turn_index(), "{}", message.as_ref());
        }
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::error!(target: "duratask::orchestration", turn_idx = self.turn_index(), "{}", message.as_ref());
        }
    }

    pub(crate) fn take_results(&self) -> (Vec<Event>, Vec<Action>) {
        let mut inner = self.inner.lock().unwrap();
        let history = std::mem::take(&mut inner.history);
        let actions = std::mem::take(&mut inner.actions);
        (history, actions)
    }

    pub(crate) fn snapshot_claims(&self) -> ClaimedIdsSnapshot {
        let inner = self.inner.lock().unwrap();
        ClaimedIdsSnapshot {
            claimed_ids: inner.claimed_ids.clone(),
            nondeterminism: inner.nondeterminism.clone(),
            leftover_schedules: inner.leftover_schedules(),
        }
    }
}

/// What a turn learned about claim state, used by the runtime's
/// nondeterminism checks after quiescence.
#[derive(Debug, Clone)]
pub struct ClaimedIdsSnapshot {
    pub claimed_ids: HashSet<u64>,
    /// Scheduling-order mismatch recorded by a future during the turn.
    pub nondeterminism: Option<String>,
    /// Scheduled events in history that no code path claimed this turn.
    pub leftover_schedules: Vec<String>,
}

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn wake(_: *const ()) {}
    fn wake_by_ref(_: *const ()) {}
    fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    // Safety: the vtable functions are all no-ops over a null pointer.
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Run one cooperative turn of `orchestrator` over `history`.
///
/// Polls the orchestrator future with a no-op waker until it either finishes
/// or stops making progress (no new actions, no new history). Returns the
/// working history (including scheduled events appended this turn), the
/// actions to dispatch, and the terminal output if the function returned.
pub fn run_turn<F, Fut>(
    history: Vec<Event>,
    orchestrator: F,
) -> (Vec<Event>, Vec<Action>, Option<Result<String, String>>)
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let baseline = history.len();
    let (h, a, out, _claims) = run_turn_with_claims(history, 0, baseline, orchestrator);
    (h, a, out)
}

/// [`run_turn`] plus the claim snapshot the runtime needs for its
/// post-quiescence nondeterminism checks.
pub fn run_turn_with_claims<F, Fut>(
    history: Vec<Event>,
    turn_index: u64,
    baseline_len: usize,
    orchestrator: F,
) -> (Vec<Event>, Vec<Action>, Option<Result<String, String>>, ClaimedIdsSnapshot)
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::for_turn(history, turn_index, baseline_len);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(orchestrator(ctx.clone()));

    let mut output = None;
    loop {
        let (hist_before, actions_before) = {
            let inner = ctx.inner.lock().unwrap();
            (inner.history.len(), inner.actions.len())
        };
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(out) => {
                output = Some(out);
                break;
            }
            Poll::Pending => {
                let inner = ctx.inner.lock().unwrap();
                if inner.nondeterminism.is_some() {
                    break;
                }
                let progressed = inner.history.len() > hist_before || inner.actions.len() > actions_before;
                if !progressed {
                    break;
                }
            }
        }
    }
    drop(fut);

    let claims = ctx.snapshot_claims();
    let (history, actions) = ctx.take_results();
    (history, actions, output, claims)
}

/// Payload codec used by the typed scheduling/registration helpers.
///
/// The JSON codec passes raw strings through unchanged so untyped and typed
/// call sites can interoperate on the same history.
pub mod _typed_codec {
    use serde::Serialize;
    use serde::de::DeserializeOwned;

    pub trait Codec {
        fn encode<T: Serialize>(value: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(value: &T) -> Result<String, String> {
            let s = serde_json::to_string(value).map_err(|e| format!("encode: {e}"))?;
            // A bare string payload stays a bare string on the wire.
            match serde_json::from_str::<serde_json::Value>(&s) {
                Ok(serde_json::Value::String(inner)) => Ok(inner),
                _ => Ok(s),
            }
        }

        fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(raw) {
                Ok(v) => Ok(v),
                Err(first_err) => {
                    // Untyped producers hand us bare strings; retry as one.
                    serde_json::from_value(serde_json::Value::String(raw.to_string()))
                        .map_err(|_| format!("decode: {first_err}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::_typed_codec::{Codec, Json};

    #[test]
    fn first_turn_schedules_and_suspends() {
        let (hist, actions, out) = run_turn(Vec::new(), |ctx| async move {
            let r = ctx.schedule_activity("Add", "1,2").into_activity().await?;
            Ok(r)
        });
        assert!(out.is_none());
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::CallActivity { id: 1, name, input, attempt: 1 } if name == "Add" && input == "1,2"
        ));
        assert!(matches!(
            &hist[0],
            Event::ActivityScheduled { id: 1, name, .. } if name == "Add"
        ));
    }

    #[test]
    fn replay_adopts_without_reemitting() {
        let history = vec![
            Event::ActivityScheduled {
                id: 1,
                name: "Add".into(),
                input: "1,2".into(),
            },
            Event::ActivityCompleted {
                id: 1,
                result: "3".into(),
            },
        ];
        let (hist, actions, out) = run_turn(history, |ctx| async move {
            let r = ctx.schedule_activity("Add", "1,2").into_activity().await?;
            Ok(r)
        });
        assert!(actions.is_empty(), "adopted schedule must not re-emit: {actions:?}");
        assert_eq!(hist.len(), 2);
        assert_eq!(out, Some(Ok("3".to_string())));
    }

    #[test]
    fn correlation_ids_follow_issuance_order() {
        let (hist, actions, _) = run_turn(Vec::new(), |ctx| async move {
            let a = ctx.schedule_activity("A", "");
            let b = ctx.schedule_activity("B", "");
            let _ = ctx.join(vec![a, b]).await;
            Ok(String::new())
        });
        assert_eq!(actions.len(), 2);
        let ids: Vec<u64> = hist.iter().filter_map(|e| e.schedule_id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn schedule_order_mismatch_is_flagged() {
        // History says a timer came first; the code schedules an activity.
        let history = vec![Event::TimerCreated { id: 1, fire_at_ms: 10 }];
        let (_, actions, out, claims) = run_turn_with_claims(history, 1, 1, |ctx| async move {
            let r = ctx.schedule_activity("Add", "1,2").into_activity().await?;
            Ok(r)
        });
        assert!(out.is_none());
        assert!(actions.is_empty());
        let msg = claims.nondeterminism.unwrap();
        assert!(msg.contains("TimerCreated"), "unexpected message: {msg}");
    }

    #[test]
    fn json_codec_passes_raw_strings_through() {
        let encoded = Json::encode(&"plain".to_string()).unwrap();
        assert_eq!(encoded, "plain");
        let decoded: String = Json::decode("plain").unwrap();
        assert_eq!(decoded, "plain");

        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct P {
            x: u32,
        }
        let e = Json::encode(&P { x: 7 }).unwrap();
        let d: P = Json::decode(&e).unwrap();
        assert_eq!(d, P { x: 7 });
    }

    #[test]
    fn logging_gate_tracks_replay_boundary() {
        // Turn 2: baseline holds the schedule, the completion is new.
        let mut history = vec![Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        }];
        let baseline = history.len();
        history.push(Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        });
        let observed = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let obs = observed.clone();
        let (_, _, out, _) = run_turn_with_claims(history, 1, baseline, move |ctx| {
            let obs = obs.clone();
            async move {
                obs.lock().unwrap().push(("before", ctx.is_replaying()));
                let r = ctx.schedule_activity("A", "").into_activity().await?;
                obs.lock().unwrap().push(("after", ctx.is_replaying()));
                Ok(r)
            }
        });
        assert_eq!(out, Some(Ok("ok".to_string())));
        let observed = observed.lock().unwrap();
        assert_eq!(observed[0], ("before", true), "pre-await code is replayed");
        assert_eq!(observed[1], ("after", false), "post-completion code is new");
    }
}
