//! Every command submission yields exactly one terminal result envelope,
//! on success and on failure alike.

mod common;

use steward::commands::{Command, CommandState};
use steward::data::ProviderRecord;
use steward::orchestrations::FanOutMode;
use steward::providers::Provider;

use common::{start, terminal_events, WAIT};

#[tokio::test]
async fn successful_command_emits_one_completed_envelope() {
    let h = start(FanOutMode::Parallel).await;
    let command = Command::UpdateProvider {
        command_id: "cmd-1".into(),
        provider: ProviderRecord::new("prov-a", "https://providers.example.com/a"),
    };

    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");

    assert_eq!(result.command_id, "cmd-1");
    assert_eq!(result.state, CommandState::Completed);
    assert!(result.errors.is_empty());
    let value = result.value.expect("stored provider");
    assert_eq!(value["id"], "prov-a");

    let history = h.store.read(&command.instance_id()).await;
    assert_eq!(terminal_events(&history), 1);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn failed_command_still_emits_exactly_one_envelope() {
    let h = start(FanOutMode::Parallel).await;
    // No such project seeded, so the activity fails deterministically.
    let command = Command::DeleteProjectUser {
        command_id: "cmd-2".into(),
        project_id: "missing".into(),
        user_id: "u-1".into(),
    };

    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");

    assert_eq!(result.state, CommandState::Failed);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("missing"));

    let history = h.store.read(&command.instance_id()).await;
    assert_eq!(terminal_events(&history), 1);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let h = start(FanOutMode::Parallel).await;
    let command = Command::UpdateProvider {
        command_id: "cmd-3".into(),
        provider: ProviderRecord::new("prov-b", "https://providers.example.com/b"),
    };

    h.client.submit_command(&command).await.expect("submit");
    h.client.submit_command(&command).await.expect("resubmit");

    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");
    assert_eq!(result.state, CommandState::Completed);

    // The second start was dropped: one start event, one terminal event.
    let history = h.store.read(&command.instance_id()).await;
    let starts = history
        .iter()
        .filter(|e| matches!(e, steward::Event::OrchestrationStarted { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(terminal_events(&history), 1);
    h.runtime.shutdown().await;
}
