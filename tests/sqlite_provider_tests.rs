//! SQLite provider: queue semantics, transactional commits, and an
//! end-to-end workflow run on a file-backed database.

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use steward::commands::{Command, CommandState};
use steward::data::ProviderRecord;
use steward::orchestrations::FanOutMode;
use steward::providers::{Provider, QueueKind, SqliteProvider, WorkItem};
use steward::Event;

use common::{start_on, WAIT};

#[tokio::test]
async fn peek_lock_round_trip() {
    let provider = SqliteProvider::new_in_memory().await.expect("open");
    let item = WorkItem::CancelInstance {
        instance: "i-1".into(),
        reason: "test".into(),
    };
    provider
        .enqueue_work(QueueKind::Orchestrator, item.clone(), None)
        .await
        .expect("enqueue");

    let (got, token) = provider.dequeue_peek_lock(QueueKind::Orchestrator).await.expect("item");
    assert_eq!(got, item);
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    provider.abandon(QueueKind::Orchestrator, &token).await.expect("abandon");
    let (again, token2) = provider.dequeue_peek_lock(QueueKind::Orchestrator).await.expect("redelivered");
    assert_eq!(again, item);
    provider.ack(QueueKind::Orchestrator, &token2).await.expect("ack");
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn commit_is_transactional() {
    let provider = SqliteProvider::new_in_memory().await.expect("open");
    provider.create_instance("i-1").await.expect("create");
    assert!(provider.instance_exists("i-1").await);
    provider
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::StartOrchestration {
                instance: "i-1".into(),
                orchestration: "W".into(),
                input: String::new(),
            },
            None,
        )
        .await
        .expect("enqueue");
    let (_, token) = provider.dequeue_peek_lock(QueueKind::Orchestrator).await.expect("item");

    provider
        .ack_orchestration_item(
            &token,
            "i-1",
            vec![
                Event::OrchestrationStarted {
                    name: "W".into(),
                    input: String::new(),
                },
                Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: String::new(),
                },
            ],
            vec![WorkItem::ActivityExecute {
                instance: "i-1".into(),
                id: 1,
                name: "A".into(),
                input: String::new(),
            }],
            vec![],
            vec![],
        )
        .await
        .expect("commit");

    let history = provider.read("i-1").await;
    assert_eq!(history.len(), 2);
    assert!(provider.dequeue_peek_lock(QueueKind::Worker).await.is_some());
    // The consumed orchestrator item is gone.
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn expired_lease_makes_the_item_visible_again() {
    let provider = SqliteProvider::new_in_memory()
        .await
        .expect("open")
        .with_lock_lease(100);
    let item = WorkItem::CancelInstance {
        instance: "i-1".into(),
        reason: "test".into(),
    };
    provider
        .enqueue_work(QueueKind::Orchestrator, item.clone(), None)
        .await
        .expect("enqueue");

    let (_, stale_token) = provider.dequeue_peek_lock(QueueKind::Orchestrator).await.expect("item");
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    // The consumer dies; once the lease expires the item is redelivered
    // under a fresh token and the stale ack misses.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let (again, _relock) = provider.dequeue_peek_lock(QueueKind::Orchestrator).await.expect("redelivered");
    assert_eq!(again, item);

    provider.ack(QueueKind::Orchestrator, &stale_token).await.expect("noop ack");
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let (still_there, token) = provider
        .dequeue_peek_lock(QueueKind::Orchestrator)
        .await
        .expect("survived stale ack");
    assert_eq!(still_there, item);
    provider.ack(QueueKind::Orchestrator, &token).await.expect("ack");
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}

#[tokio::test]
async fn delayed_visibility_holds_items_back() {
    let provider = SqliteProvider::new_in_memory().await.expect("open");
    provider
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::TimerFired {
                instance: "i-1".into(),
                id: 1,
                fire_at_ms: 0,
            },
            Some(200),
        )
        .await
        .expect("enqueue");
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert!(provider.dequeue_peek_lock(QueueKind::Orchestrator).await.is_some());
}

#[tokio::test]
async fn end_to_end_command_on_a_file_backed_database() {
    let dir = TempDir::new().expect("tempdir");
    let url = format!("sqlite:{}/steward.db", dir.path().display());
    let store = Arc::new(SqliteProvider::new(&url).await.expect("open"));

    let h = start_on(store, FanOutMode::Parallel).await;
    let command = Command::UpdateProvider {
        command_id: "cmd-sql".into(),
        provider: ProviderRecord::new("prov-a", "https://providers.example.com/a"),
    };
    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");
    assert_eq!(result.state, CommandState::Completed);

    let history = h.store.read(&command.instance_id()).await;
    assert!(history.iter().any(|e| e.is_terminal()));
    h.runtime.shutdown().await;
}
