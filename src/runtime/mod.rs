//! Runtime: three dispatcher loops over the provider queues.
//!
//! - orchestrator: consumes start/completion/cancel items, runs one turn of
//!   the workflow, and commits the turn atomically (history delta plus
//!   dispatched work items plus the consumed queue item).
//! - worker: executes activities and reports their results back to the
//!   orchestrator queue.
//! - timer: converts timer schedules into delayed timer-fired items.
//!
//! Each dispatched item is processed under a peek-lock; a failed commit
//! abandons the item for redelivery, so turns are at-least-once with
//! duplicate suppression in history.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::locks::{Acquire, Grant, LockManager, LockPolicy};
use crate::providers::{Provider, ProviderError, QueueKind, WorkItem};
use crate::{Action, Event};

pub mod registry;

mod execution;
mod status;

pub use registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};
pub use status::OrchestrationStatus;

use execution::{run_turn, TurnOutcome};
use registry::ActivityHandler;

const COMMIT_ATTEMPTS: u32 = 5;
const COMMIT_BACKOFF_BASE_MS: u64 = 10;

/// Marker prefix for lookups of a name nothing was registered under.
pub const UNREGISTERED_PREFIX: &str = "unregistered:";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a dispatcher finds its queue empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// What a contended lock acquisition does.
    pub lock_policy: LockPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            lock_policy: LockPolicy::FailFast,
        }
    }
}

pub struct Runtime {
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    locks: Arc<LockManager>,
    options: RuntimeOptions,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime with default options over the given store.
    pub async fn start(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        init_tracing();
        let runtime = Arc::new(Self {
            store,
            activities,
            orchestrations,
            locks: LockManager::new(),
            options,
            joins: Mutex::new(Vec::new()),
        });
        runtime.restore_locks().await;

        let mut joins = Vec::with_capacity(3);
        {
            let rt = runtime.clone();
            joins.push(tokio::spawn(async move { rt.orchestration_dispatcher().await }));
        }
        {
            let rt = runtime.clone();
            joins.push(tokio::spawn(async move { rt.worker_dispatcher().await }));
        }
        {
            let rt = runtime.clone();
            joins.push(tokio::spawn(async move { rt.timer_dispatcher().await }));
        }
        if let Ok(mut guard) = runtime.joins.lock() {
            *guard = joins;
        }
        info!(
            orchestrations = runtime.orchestrations.names().len(),
            activities = runtime.activities.names().len(),
            "runtime started"
        );
        runtime
    }

    /// Stop the dispatcher loops. In-flight peek-locked items are abandoned
    /// by the provider's redelivery semantics, not lost.
    pub async fn shutdown(&self) {
        let joins = match self.joins.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for join in &joins {
            join.abort();
        }
        for join in joins {
            let _ = join.await;
        }
        info!("runtime stopped");
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.locks.clone()
    }

    /// Rebuild the lock table from persisted histories before dispatch
    /// starts, so holdings survive a process restart. An instance holds a
    /// resource if its acquisition is recorded without a matching release
    /// and the instance has not reached a terminal state.
    async fn restore_locks(&self) {
        let mut held: Vec<(String, String)> = Vec::new();
        let mut pending: Vec<(String, u64, String)> = Vec::new();
        for instance in self.store.list_instances().await {
            let history = self.store.read(&instance).await;
            if history.is_empty() || history.iter().any(Event::is_terminal) {
                continue;
            }
            for event in &history {
                match event {
                    Event::LockRequested { id, resource } => {
                        pending.push((instance.clone(), *id, resource.clone()))
                    }
                    Event::LockAcquired { id, resource } => {
                        pending.retain(|(inst, req, _)| inst != &instance || req != id);
                        held.push((instance.clone(), resource.clone()));
                    }
                    Event::LockDenied { id, .. } => {
                        pending.retain(|(inst, req, _)| inst != &instance || req != id)
                    }
                    Event::LockReleased { resource, .. } => {
                        if let Some(pos) = held
                            .iter()
                            .position(|(inst, r)| inst == &instance && r == resource)
                        {
                            held.remove(pos);
                        }
                    }
                    _ => {}
                }
            }
        }
        // Holdings first, across all instances; only then the requests that
        // never saw an outcome, so a pending request cannot jump ahead of a
        // holder that happens to be scanned later.
        for (instance, resource) in held {
            self.locks.acquire(&resource, &instance, 0, LockPolicy::FailFast).await;
            debug!(instance = %instance, resource = %resource, "restored lock holding");
        }
        for (instance, id, resource) in pending {
            let acquired = self
                .locks
                .acquire(&resource, &instance, id, self.options.lock_policy)
                .await;
            // A free resource means the outcome was never dispatched; grant
            // it now. The idempotent enqueue collapses this with any copy
            // still sitting in the queue.
            if acquired == Acquire::Acquired {
                let item = WorkItem::LockAcquired {
                    instance: instance.clone(),
                    id,
                    resource: resource.clone(),
                };
                if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item, None).await {
                    warn!(instance = %instance, resource = %resource, error = %e, "failed to dispatch restored lock grant");
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
    }

    async fn orchestration_dispatcher(&self) {
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                Some((item, token)) => self.process_orchestrator_item(item, &token).await,
                None => self.idle().await,
            }
        }
    }

    async fn worker_dispatcher(&self) {
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                Some((item, token)) => self.process_worker_item(item, &token).await,
                None => self.idle().await,
            }
        }
    }

    async fn timer_dispatcher(&self) {
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Timer).await {
                Some((item, token)) => self.process_timer_item(item, &token).await,
                None => self.idle().await,
            }
        }
    }

    async fn process_worker_item(&self, item: WorkItem, token: &str) {
        let WorkItem::ActivityExecute {
            instance,
            id,
            name,
            input,
        } = item
        else {
            warn!(kind = item.kind(), "unexpected item on worker queue, dropping");
            let _ = self.store.ack(QueueKind::Worker, token).await;
            return;
        };

        let result = match self.activities.get(&name) {
            Some(handler) => self.invoke_activity(handler, &instance, &name, input).await,
            None => {
                warn!(instance, activity = %name, "activity not registered");
                Err(format!("{UNREGISTERED_PREFIX}{name}"))
            }
        };

        let completion = match result {
            Ok(result) => WorkItem::ActivityCompleted { instance, id, result },
            Err(error) => WorkItem::ActivityFailed { instance, id, error },
        };
        // Report the completion before acking, so a crash in between yields a
        // redelivered execution rather than a lost result.
        match self.store.enqueue_work(QueueKind::Orchestrator, completion, None).await {
            Ok(()) => {
                let _ = self.store.ack(QueueKind::Worker, token).await;
            }
            Err(e) => {
                error!(error = %e, "failed to report activity completion");
                let _ = self.store.abandon(QueueKind::Worker, token).await;
            }
        }
    }

    async fn invoke_activity(
        &self,
        handler: Arc<dyn ActivityHandler>,
        instance: &str,
        name: &str,
        input: String,
    ) -> Result<String, String> {
        let ctx = ActivityContext {
            instance: instance.to_string(),
            name: name.to_string(),
        };
        debug!(instance, activity = %name, "executing activity");
        handler.invoke(ctx, input).await
    }

    async fn process_timer_item(&self, item: WorkItem, token: &str) {
        let WorkItem::TimerSchedule { instance, id, fire_at_ms } = item else {
            warn!(kind = item.kind(), "unexpected item on timer queue, dropping");
            let _ = self.store.ack(QueueKind::Timer, token).await;
            return;
        };

        let delay_ms = fire_at_ms.saturating_sub(now_ms());
        let fired = WorkItem::TimerFired { instance, id, fire_at_ms };
        match self
            .store
            .enqueue_work(QueueKind::Orchestrator, fired, Some(delay_ms))
            .await
        {
            Ok(()) => {
                let _ = self.store.ack(QueueKind::Timer, token).await;
            }
            Err(e) => {
                error!(error = %e, "failed to schedule timer firing");
                let _ = self.store.abandon(QueueKind::Timer, token).await;
            }
        }
    }

    async fn process_orchestrator_item(&self, item: WorkItem, token: &str) {
        match item {
            WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
            } => self.handle_start(&instance, &orchestration, input, token).await,
            WorkItem::CancelInstance { instance, reason } => self.handle_cancel(&instance, reason, token).await,
            WorkItem::ActivityCompleted { instance, id, result } => {
                self.handle_completion(&instance, Event::ActivityCompleted { id, result }, token)
                    .await
            }
            WorkItem::ActivityFailed { instance, id, error } => {
                self.handle_completion(&instance, Event::ActivityFailed { id, error }, token)
                    .await
            }
            WorkItem::TimerFired { instance, id, fire_at_ms } => {
                self.handle_completion(&instance, Event::TimerFired { id, fire_at_ms }, token)
                    .await
            }
            WorkItem::LockAcquired { instance, id, resource } => {
                self.handle_completion(&instance, Event::LockAcquired { id, resource }, token)
                    .await
            }
            WorkItem::LockDenied {
                instance,
                id,
                resource,
                holder,
            } => {
                self.handle_completion(&instance, Event::LockDenied { id, resource, holder }, token)
                    .await
            }
            other => {
                warn!(kind = other.kind(), "unexpected item on orchestrator queue, dropping");
                let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            }
        }
    }

    async fn handle_start(&self, instance: &str, orchestration: &str, input: String, token: &str) {
        if let Err(e) = self.store.create_instance(instance).await {
            error!(instance, error = %e, "instance creation failed");
            let _ = self.store.abandon(QueueKind::Orchestrator, token).await;
            return;
        }
        let history = self.store.read(instance).await;
        if !history.is_empty() {
            // Duplicate start delivery; the first one won.
            warn!(instance, orchestration, "duplicate start ignored");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        }

        let started = Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.clone(),
        };

        let Some(handler) = self.orchestrations.get(orchestration) else {
            warn!(instance, orchestration, "orchestration not registered");
            let delta = vec![
                started,
                Event::OrchestrationFailed {
                    error: format!("{UNREGISTERED_PREFIX}{orchestration}"),
                },
            ];
            self.commit(token, instance, delta, Vec::new(), Vec::new(), Vec::new()).await;
            return;
        };

        info!(instance, orchestration, "starting orchestration");
        let history = vec![started.clone()];
        let outcome = run_turn(instance, history, 0, handler, input).await;
        self.commit_turn(instance, orchestration, vec![started], outcome, token).await;
    }

    async fn handle_completion(&self, instance: &str, completion: Event, token: &str) {
        let history = self.store.read(instance).await;
        if history.is_empty() {
            warn!(instance, "completion for unknown instance dropped");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        }
        if history.iter().any(Event::is_terminal) {
            debug!(instance, "completion after terminal state dropped");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        }
        let id = completion.correlation_id().unwrap_or(0);
        if history.iter().any(|e| e.correlation_id() == Some(id) && is_completion(e)) {
            debug!(instance, id, "duplicate completion dropped");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        }
        let Some((orchestration, input)) = start_info(&history) else {
            warn!(instance, "history has no start event, dropping completion");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        };
        let Some(handler) = self.orchestrations.get(&orchestration) else {
            // Registration changed under a live instance; fail it.
            let delta = vec![
                completion,
                Event::OrchestrationFailed {
                    error: format!("{UNREGISTERED_PREFIX}{orchestration}"),
                },
            ];
            self.commit(token, instance, delta, Vec::new(), Vec::new(), Vec::new()).await;
            return;
        };

        let mut replay = history;
        let fresh_from = replay.len();
        replay.push(completion.clone());
        let outcome = run_turn(instance, replay, fresh_from, handler, input).await;
        self.commit_turn(instance, &orchestration, vec![completion], outcome, token).await;
    }

    async fn handle_cancel(&self, instance: &str, reason: String, token: &str) {
        let history = self.store.read(instance).await;
        if history.is_empty() || history.iter().any(Event::is_terminal) {
            debug!(instance, "cancel for missing or finished instance dropped");
            let _ = self.store.ack(QueueKind::Orchestrator, token).await;
            return;
        }
        info!(instance, reason = %reason, "terminating orchestration");
        let delta = vec![Event::OrchestrationTerminated { reason }];
        let grants = self.locks.release_all(instance).await;
        let orchestrator_items = grants.into_iter().map(grant_item).collect();
        self.commit(token, instance, delta, Vec::new(), Vec::new(), orchestrator_items)
            .await;
    }

    /// Translate a turn's actions and output into the history delta plus the
    /// work items to dispatch, then commit everything atomically.
    async fn commit_turn(
        &self,
        instance: &str,
        orchestration: &str,
        mut history_delta: Vec<Event>,
        outcome: TurnOutcome,
        token: &str,
    ) {
        let mut worker_items = Vec::new();
        let mut timer_items = Vec::new();
        let mut orchestrator_items = Vec::new();

        for action in outcome.actions {
            match action {
                Action::CallActivity { id, name, input } => {
                    history_delta.push(Event::ActivityScheduled {
                        id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    worker_items.push(WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        id,
                        name,
                        input,
                    });
                }
                Action::CreateTimer { id, delay_ms } => {
                    let fire_at_ms = now_ms() + delay_ms;
                    history_delta.push(Event::TimerCreated { id, fire_at_ms, delay_ms });
                    timer_items.push(WorkItem::TimerSchedule {
                        instance: instance.to_string(),
                        id,
                        fire_at_ms,
                    });
                }
                Action::AcquireLock { id, resource } => {
                    history_delta.push(Event::LockRequested {
                        id,
                        resource: resource.clone(),
                    });
                    match self
                        .locks
                        .acquire(&resource, instance, id, self.options.lock_policy)
                        .await
                    {
                        Acquire::Acquired => orchestrator_items.push(WorkItem::LockAcquired {
                            instance: instance.to_string(),
                            id,
                            resource,
                        }),
                        Acquire::Held { holder } => orchestrator_items.push(WorkItem::LockDenied {
                            instance: instance.to_string(),
                            id,
                            resource,
                            holder,
                        }),
                        Acquire::Queued => {
                            debug!(instance, resource = %resource, "lock contended, waiting for release");
                        }
                    }
                }
                Action::ReleaseLock { id, resource } => {
                    history_delta.push(Event::LockReleased {
                        id,
                        resource: resource.clone(),
                    });
                    if let Some(grant) = self.locks.release(&resource, instance).await {
                        orchestrator_items.push(grant_item(grant));
                    }
                }
                Action::SystemCall { id, op, value } => {
                    history_delta.push(Event::SystemCall { id, op, value });
                }
            }
        }

        match outcome.output {
            Some(Ok(output)) => {
                info!(instance, orchestration, "orchestration completed");
                history_delta.push(Event::OrchestrationCompleted { output: output.clone() });
                for grant in self.locks.release_all(instance).await {
                    orchestrator_items.push(grant_item(grant));
                }
                if let Some(successor) = self.orchestrations.successor_of(orchestration) {
                    let next_instance = format!("{instance}~{successor}");
                    info!(instance, successor, next_instance = %next_instance, "chaining follow-up orchestration");
                    orchestrator_items.push(WorkItem::StartOrchestration {
                        instance: next_instance,
                        orchestration: successor.to_string(),
                        input: output,
                    });
                }
            }
            Some(Err(error)) => {
                warn!(instance, orchestration, error = %error, "orchestration failed");
                history_delta.push(Event::OrchestrationFailed { error });
                for grant in self.locks.release_all(instance).await {
                    orchestrator_items.push(grant_item(grant));
                }
            }
            None => {}
        }

        self.commit(token, instance, history_delta, worker_items, timer_items, orchestrator_items)
            .await;
    }

    /// Commit with bounded retry on retryable storage errors; abandon the
    /// consumed item if the commit cannot be made to stick.
    async fn commit(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) {
        let mut attempt = 0;
        loop {
            let result = self
                .store
                .ack_orchestration_item(
                    token,
                    instance,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    orchestrator_items.clone(),
                )
                .await;
            match result {
                Ok(()) => return,
                Err(e) if e.retryable && attempt + 1 < COMMIT_ATTEMPTS => {
                    attempt += 1;
                    let backoff = COMMIT_BACKOFF_BASE_MS << attempt;
                    warn!(instance, attempt, error = %e, "commit failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    self.abandon_commit(token, instance, &e).await;
                    return;
                }
            }
        }
    }

    async fn abandon_commit(&self, token: &str, instance: &str, e: &ProviderError) {
        error!(instance, error = %e, "commit abandoned, item will be redelivered");
        let _ = self.store.abandon(QueueKind::Orchestrator, token).await;
    }
}

fn grant_item(grant: Grant) -> WorkItem {
    WorkItem::LockAcquired {
        instance: grant.instance,
        id: grant.id,
        resource: grant.resource,
    }
}

fn is_completion(event: &Event) -> bool {
    matches!(
        event,
        Event::ActivityCompleted { .. }
            | Event::ActivityFailed { .. }
            | Event::TimerFired { .. }
            | Event::LockAcquired { .. }
            | Event::LockDenied { .. }
    )
}

fn start_info(history: &[Event]) -> Option<(String, String)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, input } => Some((name.clone(), input.clone())),
        _ => None,
    })
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
