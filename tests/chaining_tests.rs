//! Provider update chains into registration: fire-and-forget, success only.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use steward::commands::{Command, CommandResult, CommandState};
use steward::data::{ProviderRecord, Repository, RepositoryError};
use steward::orchestrations::{FanOutMode, Services};
use steward::providers::InMemoryProvider;
use steward::OrchestrationStatus;

use common::{start, start_with_services, WAIT};

#[tokio::test]
async fn successful_update_chains_exactly_one_registration() {
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
        .expect("update envelope");
    assert_eq!(result.state, CommandState::Completed);

    // The successor runs under a derived instance id, fed with the update's
    // envelope.
    let successor = format!("{}~ProviderRegister", command.instance_id());
    let status = h
        .client
        .wait_for_orchestration(&successor, WAIT)
        .await
        .expect("registration finishes");
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected registration success, got {status:?}");
    };
    let envelope = CommandResult::from_terminal_payload(&output).expect("envelope");
    assert_eq!(envelope.command_id, "cmd-1-register");
    assert_eq!(envelope.state, CommandState::Completed);

    // Registration stamped and persisted the record.
    let stored = h
        .services
        .providers
        .get("prov-a")
        .await
        .expect("get")
        .expect("stored");
    assert!(stored.registered_at_ms.is_some());
    assert!(stored.properties.contains_key("principalId"));
    h.runtime.shutdown().await;
}

struct BrokenProviders;

#[async_trait]
impl Repository<ProviderRecord> for BrokenProviders {
    async fn get(&self, _id: &str) -> Result<Option<ProviderRecord>, RepositoryError> {
        Err(RepositoryError::Permanent("directory offline".into()))
    }
    async fn remove(&self, _id: &str) -> Result<Option<ProviderRecord>, RepositoryError> {
        Err(RepositoryError::Permanent("directory offline".into()))
    }
    async fn upsert(&self, _doc: ProviderRecord) -> Result<ProviderRecord, RepositoryError> {
        Err(RepositoryError::Permanent("directory offline".into()))
    }
    async fn list(&self) -> Result<Vec<ProviderRecord>, RepositoryError> {
        Err(RepositoryError::Permanent("directory offline".into()))
    }
}

#[tokio::test]
async fn failed_update_does_not_chain() {
    let services = Services {
        providers: Arc::new(BrokenProviders),
        ..Services::in_memory()
    };
    let h = start_with_services(Arc::new(InMemoryProvider::new()), services, FanOutMode::Parallel).await;

    let command = Command::UpdateProvider {
        command_id: "cmd-2".into(),
        provider: ProviderRecord::new("prov-a", "https://providers.example.com/a"),
    };
    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("update envelope");
    assert_eq!(result.state, CommandState::Failed);

    // Give any (wrong) successor start time to land, then check it never did.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let successor = format!("{}~ProviderRegister", command.instance_id());
    assert_eq!(h.client.status(&successor).await, OrchestrationStatus::NotFound);
    h.runtime.shutdown().await;
}
