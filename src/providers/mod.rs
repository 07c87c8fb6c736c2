//! Engine persistence: per-instance history stores plus the three work-item
//! queues (orchestrator, worker, timer) with peek-lock semantics and delayed
//! visibility.
//!
//! Providers are datastores only; the runtime owns dispatch. A dequeued item
//! stays invisible until it is acked (after a successful commit) or
//! abandoned (after a failed one), so a crashed dispatcher never loses work:
//! peek-locks carry a lease, and an item whose consumer died is redelivered
//! once the lease expires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryProvider;
pub use sqlite::SqliteProvider;

/// Messages flowing through the provider queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    LockAcquired {
        instance: String,
        id: u64,
        resource: String,
    },
    LockDenied {
        instance: String,
        id: u64,
        resource: String,
        holder: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::LockAcquired { instance, .. }
            | WorkItem::LockDenied { instance, .. }
            | WorkItem::CancelInstance { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::LockAcquired { .. } => "LockAcquired",
            WorkItem::LockDenied { .. } => "LockDenied",
            WorkItem::CancelInstance { .. } => "CancelInstance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
            QueueKind::Timer => "timer",
        }
    }
}

/// Storage error with retry classification. The runtime retries retryable
/// failures with bounded backoff before abandoning the work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.operation,
            if self.retryable { "retryable" } else { "permanent" },
            self.message
        )
    }
}

impl std::error::Error for ProviderError {}

/// History store plus work-item queues backing a runtime.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Full history for an instance; empty if unknown or not yet started.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Create a new, empty instance; idempotent.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;

    async fn instance_exists(&self, instance: &str) -> bool;

    async fn list_instances(&self) -> Vec<String>;

    /// Enqueue one item, optionally invisible for `delay_ms`.
    async fn enqueue_work(&self, queue: QueueKind, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError>;

    /// Dequeue the next visible item under a peek-lock token, or `None`.
    async fn dequeue_peek_lock(&self, queue: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return a dequeued item to its queue for redelivery.
    async fn abandon(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Atomically commit one orchestration turn: append the history delta,
    /// enqueue the dispatched work items, and ack the consumed orchestrator
    /// item identified by `token`.
    async fn ack_orchestration_item(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Drop all stored state (test utility).
    async fn reset(&self);
}
