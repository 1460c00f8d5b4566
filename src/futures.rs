//! Durable futures: the in-memory bookkeeping between orchestrator code and
//! history. Rebuilt from scratch on every replay pass.
//!
//! A [`DurableFuture`] claims its scheduled event on first poll: if the next
//! unclaimed scheduled event in history matches the operation being issued it
//! adopts that event's correlation id, otherwise the turn is flagged
//! nondeterministic. If history holds no more scheduled events the future
//! allocates the next id, records the scheduled event, and emits the action,
//! exactly once across all replays. Completions resolve by claimed id.
//!
//! Aggregates probe all constituents each pass before deciding, so every
//! constituent claims its scheduled event even when the aggregate resolves
//! early (fail-fast or select): claims must not depend on which branch wins.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::{Action, CtxInner, Event, OrchestrationContext, now_ms};

const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
    assert_unpin::<JoinFuture>();
    assert_unpin::<SelectFuture>();
    assert_unpin::<WhenAllFuture>();
};

/// Resolution of a single durable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

impl DurableOutput {
    /// Uniform success/failure view used by `when_all`; value-less outputs
    /// succeed with an empty string.
    pub(crate) fn into_result(self) -> Result<String, String> {
        match self {
            DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r,
            DurableOutput::Timer => Ok(String::new()),
            DurableOutput::External(data) => Ok(data),
        }
    }
}

#[derive(Debug)]
enum Kind {
    Activity { name: String, input: String, attempt: u32 },
    Timer { delay_ms: u64 },
    External { name: String },
    SubOrchestration { name: String, version: Option<String>, input: String },
}

enum Probe {
    /// Nondeterminism was flagged; the turn is about to abort.
    Blocked,
    Pending,
    Ready { index: usize, output: DurableOutput },
}

/// One pending durable operation. One-shot; claims its correlation id on
/// first poll and resolves from history thereafter.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed_id: Cell<Option<u64>>,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String, attempt: u32) -> Self {
        Self {
            ctx,
            kind: Kind::Activity { name, input, attempt },
            claimed_id: Cell::new(None),
        }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self {
            ctx,
            kind: Kind::Timer { delay_ms },
            claimed_id: Cell::new(None),
        }
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self {
            ctx,
            kind: Kind::External { name },
            claimed_id: Cell::new(None),
        }
    }

    pub(crate) fn sub_orchestration(
        ctx: OrchestrationContext,
        name: String,
        version: Option<String>,
        input: String,
    ) -> Self {
        Self {
            ctx,
            kind: Kind::SubOrchestration { name, version, input },
            claimed_id: Cell::new(None),
        }
    }

    fn describe_issue(&self) -> String {
        match &self.kind {
            Kind::Activity { name, .. } => format!("CallActivity('{name}')"),
            Kind::Timer { .. } => "CreateTimer".to_string(),
            Kind::External { name } => format!("WaitExternal('{name}')"),
            Kind::SubOrchestration { name, .. } => format!("StartSubOrchestration('{name}')"),
        }
    }

    fn matches_schedule(&self, event: &Event) -> bool {
        match (&self.kind, event) {
            (Kind::Activity { name, input, .. }, Event::ActivityScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            (Kind::Timer { .. }, Event::TimerCreated { .. }) => true,
            (Kind::External { name }, Event::ExternalSubscribed { name: n, .. }) => name == n,
            (
                Kind::SubOrchestration { name, input, .. },
                Event::SubOrchestrationScheduled { name: n, input: i, .. },
            ) => name == n && input == i,
            _ => false,
        }
    }

    fn make_schedule(&self, id: u64) -> (Event, Action) {
        match &self.kind {
            Kind::Activity { name, input, attempt } => (
                Event::ActivityScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                },
                Action::CallActivity {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                    attempt: *attempt,
                },
            ),
            Kind::Timer { delay_ms } => {
                // Stamped once here; replays adopt the recorded fire time.
                let fire_at_ms = now_ms().saturating_add(*delay_ms);
                (
                    Event::TimerCreated { id, fire_at_ms },
                    Action::CreateTimer { id, fire_at_ms },
                )
            }
            Kind::External { name } => (
                Event::ExternalSubscribed { id, name: name.clone() },
                Action::WaitExternal { id, name: name.clone() },
            ),
            Kind::SubOrchestration { name, version, input } => {
                let instance = format!("sub::{id}");
                (
                    Event::SubOrchestrationScheduled {
                        id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    },
                    Action::StartSubOrchestration {
                        id,
                        name: name.clone(),
                        version: version.clone(),
                        instance,
                        input: input.clone(),
                    },
                )
            }
        }
    }

    /// Adopt the next unclaimed scheduled event or allocate a fresh id.
    /// Returns `None` when the frontier mismatches (nondeterminism recorded).
    fn ensure_claimed(&self, inner: &mut CtxInner) -> Option<u64> {
        if let Some(id) = self.claimed_id.get() {
            return Some(id);
        }
        match inner.next_unclaimed_schedule() {
            Some(index) => {
                let event = inner.history[index].clone();
                if self.matches_schedule(&event) {
                    let id = match event.schedule_id() {
                        Some(id) => id,
                        None => return None,
                    };
                    inner.claim(index, id);
                    self.claimed_id.set(Some(id));
                    Some(id)
                } else {
                    inner.record_nondeterminism(format!(
                        "nondeterministic: schedule order mismatch: next recorded is {} but code issued {}",
                        event.describe(),
                        self.describe_issue()
                    ));
                    None
                }
            }
            None => {
                let id = inner.next_correlation_id();
                let (event, action) = self.make_schedule(id);
                let index = inner.history.len();
                inner.history.push(event);
                inner.claim(index, id);
                inner.actions.push(action);
                self.claimed_id.set(Some(id));
                Some(id)
            }
        }
    }

    fn find_completion(&self, inner: &CtxInner, id: u64) -> Option<(usize, DurableOutput)> {
        for (index, event) in inner.history.iter().enumerate() {
            if inner.consumed_indices.contains(&index) {
                continue;
            }
            let output = match (&self.kind, event) {
                (Kind::Activity { .. }, Event::ActivityCompleted { id: eid, result }) if *eid == id => {
                    DurableOutput::Activity(Ok(result.clone()))
                }
                (Kind::Activity { .. }, Event::ActivityFailed { id: eid, details }) if *eid == id => {
                    DurableOutput::Activity(Err(details.display_message()))
                }
                (Kind::Timer { .. }, Event::TimerFired { id: eid, .. }) if *eid == id => DurableOutput::Timer,
                (Kind::External { .. }, Event::ExternalEvent { id: eid, data, .. }) if *eid == id => {
                    DurableOutput::External(data.clone())
                }
                (Kind::SubOrchestration { .. }, Event::SubOrchestrationCompleted { id: eid, result }) if *eid == id => {
                    DurableOutput::SubOrchestration(Ok(result.clone()))
                }
                (Kind::SubOrchestration { .. }, Event::SubOrchestrationFailed { id: eid, details }) if *eid == id => {
                    DurableOutput::SubOrchestration(Err(details.display_message()))
                }
                _ => continue,
            };
            return Some((index, output));
        }
        None
    }

    fn probe(&self, inner: &mut CtxInner) -> Probe {
        if inner.nondeterminism.is_some() {
            return Probe::Blocked;
        }
        let id = match self.ensure_claimed(inner) {
            Some(id) => id,
            None => return Probe::Blocked,
        };
        match self.find_completion(inner, id) {
            Some((index, output)) => Probe::Ready { index, output },
            None => Probe::Pending,
        }
    }

    /// Await as an activity result.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => unreachable!("activity future resolved to {other:?}"),
        }
    }

    pub async fn into_activity_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_activity().await?;
        Json::decode(&raw)
    }

    /// Await as a timer elapse.
    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => unreachable!("timer future resolved to {other:?}"),
        }
    }

    /// Await as an external event payload.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(data) => data,
            other => unreachable!("external future resolved to {other:?}"),
        }
    }

    pub async fn into_event_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_event().await;
        Json::decode(&raw)
    }

    /// Await as a sub-orchestration result.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => unreachable!("sub-orchestration future resolved to {other:?}"),
        }
    }

    pub async fn into_sub_orchestration_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_sub_orchestration().await?;
        Json::decode(&raw)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();
        match this.probe(&mut inner) {
            Probe::Ready { index, output } => {
                inner.consume(index);
                Poll::Ready(output)
            }
            Probe::Pending | Probe::Blocked => Poll::Pending,
        }
    }
}

/// All constituents resolved; outputs in issuance order.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();
        let mut ready = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.probe(&mut inner) {
                Probe::Ready { index, output } => ready.push(Some((index, output))),
                Probe::Pending => ready.push(None),
                Probe::Blocked => return Poll::Pending,
            }
        }
        if ready.iter().any(|r| r.is_none()) {
            return Poll::Pending;
        }
        let mut outputs = Vec::with_capacity(ready.len());
        for entry in ready.into_iter().flatten() {
            inner.consume(entry.0);
            outputs.push(entry.1);
        }
        Poll::Ready(outputs)
    }
}

/// First constituent to complete, by completion position in history. Within
/// one delivery batch, completions were folded in ascending correlation-id
/// order, so ties resolve to the lowest id. Losers stay unconsumed; their
/// completions remain recorded in history.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();
        // Probe everything first so every branch claims its scheduled event
        // regardless of which one wins.
        let mut winner: Option<(usize, usize, DurableOutput)> = None;
        for (child_idx, child) in this.children.iter().enumerate() {
            match child.probe(&mut inner) {
                Probe::Ready { index, output } => {
                    let better = match &winner {
                        Some((best_index, _, _)) => index < *best_index,
                        None => true,
                    };
                    if better {
                        winner = Some((index, child_idx, output));
                    }
                }
                Probe::Pending => {}
                Probe::Blocked => return Poll::Pending,
            }
        }
        match winner {
            Some((index, child_idx, output)) => {
                inner.consume(index);
                Poll::Ready((child_idx, output))
            }
            None => Poll::Pending,
        }
    }
}

/// Fan-in with fail-fast semantics. Resolves `Err` with the earliest
/// failure recorded in history as soon as any constituent has failed (objects
/// still running keep running; their completions land in history unobserved).
/// Resolves `Ok` with all values in issuance order once every constituent
/// succeeded.
pub struct WhenAllFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl WhenAllFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for WhenAllFuture {
    type Output = Result<Vec<String>, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.inner.lock().unwrap();
        let mut states = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.probe(&mut inner) {
                Probe::Ready { index, output } => states.push(Some((index, output.into_result()))),
                Probe::Pending => states.push(None),
                Probe::Blocked => return Poll::Pending,
            }
        }

        // Earliest failure in history order wins; batches were folded in
        // ascending id order, so this is deterministic across replays.
        let first_failure = states
            .iter()
            .flatten()
            .filter(|(_, r)| r.is_err())
            .min_by_key(|(index, _)| *index)
            .cloned();
        if let Some((index, result)) = first_failure {
            inner.consume(index);
            let err = match result {
                Err(e) => e,
                Ok(_) => unreachable!(),
            };
            return Poll::Ready(Err(err));
        }

        if states.iter().any(|s| s.is_none()) {
            return Poll::Pending;
        }
        let mut values = Vec::with_capacity(states.len());
        for entry in states.into_iter().flatten() {
            inner.consume(entry.0);
            match entry.1 {
                Ok(v) => values.push(v),
                Err(_) => unreachable!(),
            }
        }
        Poll::Ready(Ok(values))
    }
}
