//! Durable orchestration engine for provisioning cloud project environments.
//!
//! The engine executes named workflows ("orchestrations") as deterministic,
//! replayable state machines. Every externally visible decision a workflow
//! makes — scheduling an activity, creating a timer, acquiring a lock,
//! capturing a guid or the wall clock — is recorded in an append-only event
//! history keyed by instance id. Re-running the workflow code against that
//! history reproduces the exact same decisions, which is what lets an
//! instance suspend between activity completions (consuming no compute) and
//! resume after a process restart without re-executing completed work.
//!
//! Layering, bottom up:
//! - [`providers`]: history store + work-item queues (in-memory, SQLite)
//! - [`runtime`]: dispatchers that drive orchestration turns and activities
//! - [`client`]: command submission, status queries, termination
//! - [`orchestrations`]: the provisioning workflows and their activities

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub mod client;
pub mod commands;
pub mod data;
pub mod deploy;
pub mod futures;
pub mod locks;
pub mod orchestrations;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, InstanceHandle, WaitError};
pub use commands::{Command, CommandResult, CommandState};
pub use futures::{DurableFuture, DurableOutput, JoinFuture};
pub use locks::{LockManager, LockPolicy};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

/// One entry in an orchestration instance's append-only history.
///
/// Scheduling events (`ActivityScheduled`, `TimerCreated`, `LockRequested`)
/// carry the correlation id assigned deterministically in code order; the
/// matching completion event carries the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted { name: String, input: String },
    ActivityScheduled { id: u64, name: String, input: String },
    ActivityCompleted { id: u64, result: String },
    ActivityFailed { id: u64, error: String },
    TimerCreated { id: u64, fire_at_ms: u64, delay_ms: u64 },
    TimerFired { id: u64, fire_at_ms: u64 },
    LockRequested { id: u64, resource: String },
    LockAcquired { id: u64, resource: String },
    LockDenied { id: u64, resource: String, holder: String },
    LockReleased { id: u64, resource: String },
    /// A captured non-deterministic value (guid, wall clock), replayed verbatim.
    SystemCall { id: u64, op: String, value: String },
    OrchestrationCompleted { output: String },
    OrchestrationFailed { error: String },
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// Correlation id for scheduling/completion events, if the variant has one.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. }
            | Event::LockRequested { id, .. }
            | Event::LockAcquired { id, .. }
            | Event::LockDenied { id, .. }
            | Event::LockReleased { id, .. }
            | Event::SystemCall { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// A decision recorded by workflow code during a turn. The runtime converts
/// actions into history events plus dispatched work items when it commits
/// the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { id: u64, name: String, input: String },
    CreateTimer { id: u64, delay_ms: u64 },
    AcquireLock { id: u64, resource: String },
    ReleaseLock { id: u64, resource: String },
    SystemCall { id: u64, op: String, value: String },
}

pub(crate) struct CtxInner {
    instance: String,
    history: Vec<Event>,
    /// Index of the first event appended in the current turn; everything
    /// before it is replay of prior turns.
    fresh_from: usize,
    actions: Vec<Action>,
    next_id: u64,
    /// System-call values generated during this turn, so repeated reads of
    /// the same call site observe one value before it lands in history.
    system_values: HashMap<u64, String>,
    /// Locks this instance holds, as derived from the events consumed so far.
    held_locks: HashSet<String>,
    /// Set when replay diverges from recorded history; fails the turn.
    nondeterminism: Option<String>,
    replaying: bool,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, fresh_from: usize) -> Self {
        let replaying = fresh_from > 0;
        Self {
            instance,
            history,
            fresh_from,
            actions: Vec::new(),
            next_id: 0,
            system_values: HashMap::new(),
            held_locks: HashSet::new(),
            nondeterminism: None,
            replaying,
        }
    }

    fn assign_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Find the history event carrying `id` that satisfies `pick`, and mark
    /// replay as finished once execution catches up with fresh events.
    pub(crate) fn find_event<F, T>(&mut self, id: u64, pick: F) -> Option<T>
    where
        F: Fn(&Event) -> Option<T>,
    {
        for idx in 0..self.history.len() {
            if self.history[idx].correlation_id() == Some(id) {
                if let Some(v) = pick(&self.history[idx]) {
                    if idx >= self.fresh_from {
                        self.replaying = false;
                    }
                    return Some(v);
                }
            }
        }
        None
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn held_locks_mut(&mut self) -> &mut HashSet<String> {
        &mut self.held_locks
    }

    /// Record a divergence between recorded history and what the code just
    /// asked for. The first one wins; the runtime fails the turn with it.
    pub(crate) fn flag_nondeterminism(&mut self, error: String) {
        self.nondeterminism.get_or_insert(error);
    }
}

/// Deterministic execution context handed to orchestration handlers.
///
/// Cloneable handle over shared turn state; the runtime creates one per turn
/// and collects the recorded actions afterwards.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: impl Into<String>, history: Vec<Event>, fresh_from: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, fresh_from))),
        }
    }

    pub fn instance(&self) -> String {
        self.inner.lock().expect("ctx lock").instance.clone()
    }

    /// True while the current turn is re-running decisions already recorded
    /// in prior turns. Used to suppress duplicate logging during replay.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().expect("ctx lock").replaying
    }

    /// Schedule an activity invocation; the returned future resolves with the
    /// activity's result once the worker has executed it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let id = self.inner.lock().expect("ctx lock").assign_id();
        futures::activity_future(self.clone(), id, name.into(), input.into())
    }

    /// Schedule an activity and await its result.
    pub async fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> Result<String, String> {
        self.schedule_activity(name, input).await.into_activity()
    }

    /// Durable timer; resolves after the requested delay has elapsed.
    pub fn timer(&self, delay_ms: u64) -> DurableFuture {
        let id = self.inner.lock().expect("ctx lock").assign_id();
        futures::timer_future(self.clone(), id, delay_ms)
    }

    /// Request the mutual-exclusion lock for `resource`. Resolves `Ok` once
    /// this instance holds the lock; under the fail-fast policy a contended
    /// request resolves `Err` with the current holder.
    pub fn acquire_lock(&self, resource: impl Into<String>) -> DurableFuture {
        let id = self.inner.lock().expect("ctx lock").assign_id();
        futures::lock_future(self.clone(), id, resource.into())
    }

    /// Release a lock previously acquired by this instance. Takes effect when
    /// the turn commits; the runtime also releases every held lock at any
    /// terminal transition, so a failed stage never leaves a lock dangling.
    pub fn release_lock(&self, resource: impl Into<String>) {
        let resource = resource.into();
        let mut inner = self.inner.lock().expect("ctx lock");
        let id = inner.assign_id();
        inner.held_locks.remove(&resource);
        let already = inner
            .find_event(id, |e| match e {
                Event::LockReleased { resource: r, .. } if *r == resource => Some(()),
                _ => None,
            })
            .is_some();
        if !already {
            inner.record_action(Action::ReleaseLock { id, resource });
        }
    }

    /// Whether this instance currently holds the lock for `resource`,
    /// derived deterministically from consumed history.
    pub fn holds_lock(&self, resource: &str) -> bool {
        self.inner.lock().expect("ctx lock").held_locks.contains(resource)
    }

    /// Capture a fresh guid on first execution; replayed verbatim afterwards.
    pub fn new_guid(&self) -> String {
        self.system_call("new_guid", || uuid::Uuid::new_v4().to_string())
    }

    /// Capture the current wall clock (ms since epoch) on first execution;
    /// replayed verbatim afterwards.
    pub fn now_ms(&self) -> u64 {
        self.system_call("now_ms", || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
                .to_string()
        })
        .parse()
        .unwrap_or(0)
    }

    fn system_call(&self, op: &str, generate: impl FnOnce() -> String) -> String {
        let mut inner = self.inner.lock().expect("ctx lock");
        let id = inner.assign_id();
        if let Some(v) = inner.find_event(id, |e| match e {
            Event::SystemCall { value, .. } => Some(value.clone()),
            _ => None,
        }) {
            return v;
        }
        if let Some(v) = inner.system_values.get(&id) {
            return v.clone();
        }
        let value = generate();
        inner.system_values.insert(id, value.clone());
        inner.record_action(Action::SystemCall {
            id,
            op: op.to_string(),
            value: value.clone(),
        });
        value
    }

    /// Fan-out/fan-in join: waits for every scheduled future, preserving the
    /// scheduling order of the outputs regardless of completion order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub fn trace_info(&self, msg: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::info!(instance = %self.instance(), "{}", msg.as_ref());
        }
    }

    pub fn trace_warn(&self, msg: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::warn!(instance = %self.instance(), "{}", msg.as_ref());
        }
    }

    pub fn trace_error(&self, msg: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::error!(instance = %self.instance(), "{}", msg.as_ref());
        }
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().expect("ctx lock").actions)
    }

    pub(crate) fn take_nondeterminism(&self) -> Option<String> {
        self.inner.lock().expect("ctx lock").nondeterminism.take()
    }
}
