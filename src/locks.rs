//! Named-entity mutual exclusion across orchestration instances.
//!
//! The lock table is the only cross-instance shared mutable state in the
//! engine: an explicit `resource id -> holder instance` mapping behind a
//! narrow interface, so a fake can stand in for it in tests. Acquisition is
//! exclusive per resource, re-entrant for the current holder. Contended
//! requests either fail fast (default) or queue until release, per policy.
//! The runtime releases everything an instance holds when the instance
//! reaches a terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a contended acquisition does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Deny immediately, reporting the current holder.
    FailFast,
    /// Park the requester; it is granted the lock when the holder releases.
    Wait,
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    Held { holder: String },
    Queued,
}

/// A parked acquisition that became grantable after a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub resource: String,
    pub instance: String,
    /// Correlation id of the waiting request inside its instance.
    pub id: u64,
}

#[derive(Debug, Clone)]
struct Waiter {
    instance: String,
    id: u64,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<String, String>,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

/// Keyed mutual-exclusion service shared by all instances of a runtime.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attempt to acquire `resource` for `instance`. `id` correlates a
    /// queued grant back to the suspended request inside the instance.
    pub async fn acquire(&self, resource: &str, instance: &str, id: u64, policy: LockPolicy) -> Acquire {
        let mut table = self.table.lock().await;
        match table.holders.get(resource) {
            None => {
                table.holders.insert(resource.to_string(), instance.to_string());
                Acquire::Acquired
            }
            Some(holder) if holder == instance => Acquire::Acquired,
            Some(holder) => match policy {
                LockPolicy::FailFast => Acquire::Held { holder: holder.clone() },
                LockPolicy::Wait => {
                    table.waiters.entry(resource.to_string()).or_default().push_back(Waiter {
                        instance: instance.to_string(),
                        id,
                    });
                    Acquire::Queued
                }
            },
        }
    }

    pub async fn is_locked_by(&self, resource: &str, instance: &str) -> bool {
        self.table.lock().await.holders.get(resource).map(String::as_str) == Some(instance)
    }

    pub async fn holder(&self, resource: &str) -> Option<String> {
        self.table.lock().await.holders.get(resource).cloned()
    }

    /// Release one resource held by `instance`; returns the grant handed to
    /// the next waiter, if any. Releasing a resource the instance does not
    /// hold is a no-op.
    pub async fn release(&self, resource: &str, instance: &str) -> Option<Grant> {
        let mut table = self.table.lock().await;
        Self::release_locked(&mut table, resource, instance)
    }

    /// Release every resource held by `instance`, returning all resulting
    /// grants. Called by the runtime on any terminal transition.
    pub async fn release_all(&self, instance: &str) -> Vec<Grant> {
        let mut table = self.table.lock().await;
        let held: Vec<String> = table
            .holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == instance)
            .map(|(resource, _)| resource.clone())
            .collect();
        held.iter()
            .filter_map(|resource| Self::release_locked(&mut table, resource, instance))
            .collect()
    }

    fn release_locked(table: &mut LockTable, resource: &str, instance: &str) -> Option<Grant> {
        if table.holders.get(resource).map(String::as_str) != Some(instance) {
            return None;
        }
        table.holders.remove(resource);
        let next = table.waiters.get_mut(resource).and_then(VecDeque::pop_front);
        if let Some(waiter) = next {
            table.holders.insert(resource.to_string(), waiter.instance.clone());
            Some(Grant {
                resource: resource.to_string(),
                instance: waiter.instance,
                id: waiter.id,
            })
        } else {
            None
        }
    }
}
