//! Activity retry behavior: transient failures retry under the policy's
//! budget, deterministic failures do not.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use steward::providers::InMemoryProvider;
use steward::retry::transient;
use steward::runtime::Runtime;
use steward::{
    ActivityRegistry, BackoffStrategy, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
    RetryPolicy,
};

use common::WAIT;

fn flaky_activities(counter: Arc<AtomicU32>, fail_first: u32, transient_failure: bool) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Flaky", move |_ctx, input: String| {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= fail_first {
                    if transient_failure {
                        Err(transient(format!("attempt {attempt} timed out")))
                    } else {
                        Err(format!("attempt {attempt} rejected"))
                    }
                } else {
                    Ok(input)
                }
            }
        })
        .build()
}

fn retrying_registry(policy_attempts: u32) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("CallFlaky", move |ctx: OrchestrationContext, input: String| async move {
            let policy = RetryPolicy::new(policy_attempts).with_backoff(BackoffStrategy::Fixed {
                delay: Duration::from_millis(20),
            });
            ctx.call_activity_with_retry("Flaky", input, &policy).await
        })
        .build()
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let store = Arc::new(InMemoryProvider::new());
    let counter = Arc::new(AtomicU32::new(0));
    let runtime = Runtime::start(store.clone(), flaky_activities(counter.clone(), 2, true), retrying_registry(5)).await;
    let client = Client::new(store.clone());

    client.start_orchestration("retry-1", "CallFlaky", "payload").await.expect("start");
    let status = client.wait_for_orchestration("retry-1", WAIT).await.expect("finishes");
    assert_eq!(status, OrchestrationStatus::Completed { output: "payload".into() });
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    runtime.shutdown().await;
}

#[tokio::test]
async fn exhausted_budget_surfaces_the_last_transient_error() {
    let store = Arc::new(InMemoryProvider::new());
    let counter = Arc::new(AtomicU32::new(0));
    let runtime = Runtime::start(store.clone(), flaky_activities(counter.clone(), 10, true), retrying_registry(3)).await;
    let client = Client::new(store.clone());

    client.start_orchestration("retry-2", "CallFlaky", "payload").await.expect("start");
    let status = client.wait_for_orchestration("retry-2", WAIT).await.expect("finishes");
    match status {
        OrchestrationStatus::Failed { error } => assert!(error.contains("attempt 3")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    runtime.shutdown().await;
}

#[tokio::test]
async fn deterministic_failures_are_not_retried() {
    let store = Arc::new(InMemoryProvider::new());
    let counter = Arc::new(AtomicU32::new(0));
    let runtime = Runtime::start(store.clone(), flaky_activities(counter.clone(), 10, false), retrying_registry(5)).await;
    let client = Client::new(store.clone());

    client.start_orchestration("retry-3", "CallFlaky", "payload").await.expect("start");
    let status = client.wait_for_orchestration("retry-3", WAIT).await.expect("finishes");
    match status {
        OrchestrationStatus::Failed { error } => assert!(error.contains("attempt 1 rejected")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    runtime.shutdown().await;
}
