//! In-memory provider: the default store for tests and single-process use.
//!
//! History survives runtime restarts as long as the provider value itself is
//! kept alive, which is exactly what the replay tests rely on. Peek-locks
//! carry a lease; an item whose consumer died is redelivered once the lease
//! runs out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{Provider, ProviderError, QueueKind, WorkItem};
use crate::Event;

pub(crate) const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;

#[derive(Debug, Clone)]
struct QueuedItem {
    item: WorkItem,
    visible_at_ms: u64,
}

#[derive(Default)]
struct Queues {
    orchestrator: Vec<QueuedItem>,
    worker: Vec<QueuedItem>,
    timer: Vec<QueuedItem>,
    /// Peek-locked items, invisible until ack/abandon or lease expiry:
    /// token -> (queue, item, locked until).
    invisible: HashMap<String, (QueueKind, WorkItem, u64)>,
}

impl Queues {
    fn of(&mut self, kind: QueueKind) -> &mut Vec<QueuedItem> {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator,
            QueueKind::Worker => &mut self.worker,
            QueueKind::Timer => &mut self.timer,
        }
    }
}

pub struct InMemoryProvider {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    queues: Mutex<Queues>,
    token_counter: AtomicU64,
    lock_lease_ms: u64,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_lock_lease(DEFAULT_LOCK_LEASE_MS)
    }

    /// Provider whose peek-locks expire after `lock_lease_ms`.
    pub fn with_lock_lease(lock_lease_ms: u64) -> Self {
        Self {
            histories: Mutex::default(),
            queues: Mutex::default(),
            token_counter: AtomicU64::new(0),
            lock_lease_ms,
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_token(&self, queue: QueueKind) -> String {
        format!("{}:{}", queue.as_str(), self.token_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn enqueue_locked(queues: &mut Queues, queue: QueueKind, item: WorkItem, delay_ms: Option<u64>) {
        let visible_at_ms = Self::now_ms() + delay_ms.unwrap_or(0);
        let q = queues.of(queue);
        // Idempotent enqueue: identical pending items collapse.
        if !q.iter().any(|existing| existing.item == item) {
            q.push(QueuedItem { item, visible_at_ms });
        }
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.histories.lock().await.entry(instance.to_string()).or_default();
        Ok(())
    }

    async fn instance_exists(&self, instance: &str) -> bool {
        self.histories.lock().await.contains_key(instance)
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn enqueue_work(&self, queue: QueueKind, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        let mut queues = self.queues.lock().await;
        Self::enqueue_locked(&mut queues, queue, item, delay_ms);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, queue: QueueKind) -> Option<(WorkItem, String)> {
        let mut queues = self.queues.lock().await;
        let now = Self::now_ms();
        // Expired peek-locks go back to the front of their queue; the old
        // token is forgotten, so a late ack from the dead consumer is a noop.
        let expired: Vec<String> = queues
            .invisible
            .iter()
            .filter(|(_, (_, _, locked_until))| *locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((k, item, _)) = queues.invisible.remove(&token) {
                queues.of(k).insert(0, QueuedItem { item, visible_at_ms: now });
            }
        }

        let q = queues.of(queue);
        let idx = q.iter().position(|qi| qi.visible_at_ms <= now)?;
        let item = q.remove(idx).item;
        let token = self.next_token(queue);
        queues
            .invisible
            .insert(token.clone(), (queue, item.clone(), now + self.lock_lease_ms));
        Some((item, token))
    }

    async fn ack(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut queues = self.queues.lock().await;
        match queues.invisible.remove(token) {
            Some((k, _, _)) if k == queue => Ok(()),
            // Unknown token: already acked or lease expired; idempotent.
            _ => Ok(()),
        }
    }

    async fn abandon(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut queues = self.queues.lock().await;
        if let Some((k, item, _)) = queues.invisible.remove(token) {
            if k == queue {
                queues.of(queue).insert(
                    0,
                    QueuedItem {
                        item,
                        visible_at_ms: Self::now_ms(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn ack_orchestration_item(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        // Both maps stay locked for the whole commit, making it atomic with
        // respect to every other provider call.
        let mut histories = self.histories.lock().await;
        let mut queues = self.queues.lock().await;

        let history = histories
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", format!("instance not found: {instance}")))?;
        history.extend(history_delta);

        for item in worker_items {
            Self::enqueue_locked(&mut queues, QueueKind::Worker, item, None);
        }
        for item in timer_items {
            Self::enqueue_locked(&mut queues, QueueKind::Timer, item, None);
        }
        for item in orchestrator_items {
            Self::enqueue_locked(&mut queues, QueueKind::Orchestrator, item, None);
        }

        queues.invisible.remove(token);
        Ok(())
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        let mut queues = self.queues.lock().await;
        queues.orchestrator.clear();
        queues.worker.clear();
        queues.timer.clear();
        queues.invisible.clear();
    }
}
