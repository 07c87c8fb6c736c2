//! Durable futures: the suspension points of an orchestration turn.
//!
//! Each future correlates with history through the id assigned at scheduling
//! time. Polling first looks for the matching completion event; if the
//! request is not yet recorded at all, the decision is recorded exactly once
//! and the future stays pending until a later turn replays it against the
//! delivered completion. A recorded request whose payload no longer matches
//! what the code asked for marks the turn as nondeterministic, which fails
//! the instance instead of silently replaying stale decisions.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Outcome of a resolved [`DurableFuture`].
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    Lock(Result<(), LockDenial>),
}

impl DurableOutput {
    /// Unwrap an activity result; misuse on another kind surfaces as an error
    /// rather than a panic inside workflow code.
    pub fn into_activity(self) -> Result<String, String> {
        match self {
            DurableOutput::Activity(r) => r,
            other => Err(format!("expected activity output, got {other:?}")),
        }
    }

    pub fn into_lock(self) -> Result<(), LockDenial> {
        match self {
            DurableOutput::Lock(r) => r,
            other => Err(LockDenial {
                resource: String::new(),
                holder: format!("expected lock output, got {other:?}"),
            }),
        }
    }
}

/// A contended fail-fast lock request: the resource and its current holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenial {
    pub resource: String,
    pub holder: String,
}

impl fmt::Display for LockDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock '{}' is held by '{}'", self.resource, self.holder)
    }
}

pub struct DurableFuture {
    kind: Kind,
    /// Set once the action for this id has been recorded in the current turn.
    recorded: Cell<bool>,
    ctx: OrchestrationContext,
    id: u64,
}

enum Kind {
    Activity { name: String, input: String },
    Timer { delay_ms: u64 },
    Lock { resource: String },
}

pub(crate) fn activity_future(ctx: OrchestrationContext, id: u64, name: String, input: String) -> DurableFuture {
    DurableFuture {
        kind: Kind::Activity { name, input },
        recorded: Cell::new(false),
        ctx,
        id,
    }
}

pub(crate) fn timer_future(ctx: OrchestrationContext, id: u64, delay_ms: u64) -> DurableFuture {
    DurableFuture {
        kind: Kind::Timer { delay_ms },
        recorded: Cell::new(false),
        ctx,
        id,
    }
}

pub(crate) fn lock_future(ctx: OrchestrationContext, id: u64, resource: String) -> DurableFuture {
    DurableFuture {
        kind: Kind::Lock { resource },
        recorded: Cell::new(false),
        ctx,
        id,
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        let mut inner = this.ctx.inner.lock().expect("ctx lock");

        match &this.kind {
            Kind::Activity { name, input } => {
                if let Some(result) = inner.find_event(id, |e| match e {
                    Event::ActivityCompleted { result, .. } => Some(Ok(result.clone())),
                    Event::ActivityFailed { error, .. } => Some(Err(error.clone())),
                    _ => None,
                }) {
                    return Poll::Ready(DurableOutput::Activity(result));
                }
                let scheduled = inner.find_event(id, |e| match e {
                    Event::ActivityScheduled { name, input, .. } => Some((name.clone(), input.clone())),
                    _ => None,
                });
                match scheduled {
                    Some((n, i)) => {
                        if n != *name || i != *input {
                            inner.flag_nondeterminism(format!(
                                "nondeterministic replay: history scheduled activity '{n}' where code scheduled '{name}'"
                            ));
                        }
                    }
                    None => {
                        if !this.recorded.replace(true) {
                            inner.record_action(Action::CallActivity {
                                id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                    }
                }
                Poll::Pending
            }
            Kind::Timer { delay_ms } => {
                if inner
                    .find_event(id, |e| match e {
                        Event::TimerFired { .. } => Some(()),
                        _ => None,
                    })
                    .is_some()
                {
                    return Poll::Ready(DurableOutput::Timer);
                }
                let created = inner.find_event(id, |e| match e {
                    Event::TimerCreated { delay_ms, .. } => Some(*delay_ms),
                    _ => None,
                });
                match created {
                    Some(recorded_delay) => {
                        if recorded_delay != *delay_ms {
                            inner.flag_nondeterminism(format!(
                                "nondeterministic replay: history created a {recorded_delay}ms timer where code asked for {delay_ms}ms"
                            ));
                        }
                    }
                    None => {
                        if !this.recorded.replace(true) {
                            inner.record_action(Action::CreateTimer { id, delay_ms: *delay_ms });
                        }
                    }
                }
                Poll::Pending
            }
            Kind::Lock { resource } => {
                if let Some(result) = inner.find_event(id, |e| match e {
                    Event::LockAcquired { .. } => Some(Ok(())),
                    Event::LockDenied { resource, holder, .. } => Some(Err(LockDenial {
                        resource: resource.clone(),
                        holder: holder.clone(),
                    })),
                    _ => None,
                }) {
                    if result.is_ok() {
                        let r = resource.clone();
                        inner.held_locks_mut().insert(r);
                    }
                    return Poll::Ready(DurableOutput::Lock(result));
                }
                let requested = inner.find_event(id, |e| match e {
                    Event::LockRequested { resource, .. } => Some(resource.clone()),
                    _ => None,
                });
                match requested {
                    Some(recorded) => {
                        if recorded != *resource {
                            inner.flag_nondeterminism(format!(
                                "nondeterministic replay: history requested lock '{recorded}' where code requested '{resource}'"
                            ));
                        }
                    }
                    None => {
                        if !this.recorded.replace(true) {
                            inner.record_action(Action::AcquireLock {
                                id,
                                resource: resource.clone(),
                            });
                        }
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Fan-in over a set of durable futures. Resolves once every element has
/// resolved; outputs are returned in scheduling order, independent of the
/// order completions arrived in.
pub struct JoinFuture {
    futures: Vec<DurableFuture>,
    results: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(futures: Vec<DurableFuture>) -> Self {
        let len = futures.len();
        Self {
            futures,
            results: vec![None; len],
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for (idx, fut) in this.futures.iter_mut().enumerate() {
            if this.results[idx].is_some() {
                continue;
            }
            match Pin::new(fut).poll(cx) {
                Poll::Ready(out) => this.results[idx] = Some(out),
                Poll::Pending => all_done = false,
            }
        }
        if all_done {
            Poll::Ready(this.results.iter_mut().map(|r| r.take().expect("joined result")).collect())
        } else {
            Poll::Pending
        }
    }
}
