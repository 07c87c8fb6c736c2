//! Shared harness for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use steward::orchestrations::{activity_registry, orchestration_registry, FanOutMode, Services};
use steward::providers::{InMemoryProvider, Provider};
use steward::runtime::Runtime;
use steward::{Client, Event};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub store: Arc<dyn Provider>,
    pub runtime: Arc<Runtime>,
    pub client: Client,
    pub services: Services,
}

/// Runtime over a fresh in-memory store with the shipped workflow set.
pub async fn start(mode: FanOutMode) -> Harness {
    start_on(Arc::new(InMemoryProvider::new()), mode).await
}

pub async fn start_on(store: Arc<dyn Provider>, mode: FanOutMode) -> Harness {
    start_with_services(store, Services::in_memory(), mode).await
}

pub async fn start_with_services(store: Arc<dyn Provider>, services: Services, mode: FanOutMode) -> Harness {
    let runtime = Runtime::start(
        store.clone(),
        activity_registry(services.clone()),
        orchestration_registry(mode),
    )
    .await;
    Harness {
        store: store.clone(),
        runtime,
        client: Client::new(store),
        services,
    }
}

/// Poll the stored history until `predicate` holds or the timeout elapses.
pub async fn wait_for_history<F>(store: &Arc<dyn Provider>, instance: &str, predicate: F, timeout: Duration) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let history = store.read(instance).await;
        if predicate(&history) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn terminal_events(history: &[Event]) -> usize {
    history.iter().filter(|e| e.is_terminal()).count()
}
