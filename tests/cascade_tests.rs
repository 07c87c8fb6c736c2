//! Admin deletion cascades membership removal across every project, and a
//! failing element never stops the rest of the batch.

mod common;

use async_trait::async_trait;
use std::sync::Arc;

use steward::commands::{Command, CommandState};
use steward::data::{InMemoryRepository, ProjectRecord, Repository, RepositoryError, UserRecord, UserRole};
use steward::orchestrations::{FanOutMode, Services};
use steward::providers::InMemoryProvider;

use common::{start, start_with_services, Harness, WAIT};

/// Delegates to an in-memory repository, except one poisoned project id
/// whose reads always fail.
struct PoisonedProjects {
    inner: Arc<InMemoryRepository<ProjectRecord>>,
    poisoned: String,
}

#[async_trait]
impl Repository<ProjectRecord> for PoisonedProjects {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>, RepositoryError> {
        if id == self.poisoned {
            return Err(RepositoryError::Permanent(format!("project '{id}' store corrupted")));
        }
        self.inner.get(id).await
    }
    async fn remove(&self, id: &str) -> Result<Option<ProjectRecord>, RepositoryError> {
        self.inner.remove(id).await
    }
    async fn upsert(&self, doc: ProjectRecord) -> Result<ProjectRecord, RepositoryError> {
        self.inner.upsert(doc).await
    }
    async fn list(&self) -> Result<Vec<ProjectRecord>, RepositoryError> {
        self.inner.list().await
    }
}

async fn seed_admin_with_projects(services: &Services, user_id: &str, project_ids: &[&str]) {
    services
        .users
        .upsert(UserRecord::new(user_id, UserRole::Admin))
        .await
        .expect("seed user");
    for pid in project_ids {
        services
            .projects
            .upsert(ProjectRecord::new(*pid, *pid, vec![user_id.to_string(), "u-other".into()]))
            .await
            .expect("seed project");
    }
}

async fn run_cascade_with_poisoned_element(mode: FanOutMode) -> Harness {
    let projects = InMemoryRepository::new();
    let services = Services {
        projects: Arc::new(PoisonedProjects {
            inner: projects,
            poisoned: "proj-3".into(),
        }),
        ..Services::in_memory()
    };
    let h = start_with_services(Arc::new(InMemoryProvider::new()), services, mode).await;
    seed_admin_with_projects(&h.services, "u-admin", &["proj-1", "proj-2", "proj-3", "proj-4"]).await;

    let command = Command::DeleteUser {
        command_id: "cmd-del".into(),
        user_id: "u-admin".into(),
    };
    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");

    // One element failed, captured in the envelope.
    assert_eq!(result.state, CommandState::Failed);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("proj-3"), "got: {:?}", result.errors);
    let value = result.value.expect("cascade summary");
    assert_eq!(value["cascaded_projects"], 4);

    // The other three projects still lost the membership.
    for pid in ["proj-1", "proj-2", "proj-4"] {
        let project = h.services.projects.get(pid).await.expect("get").expect("present");
        assert!(
            !project.users.iter().any(|u| u == "u-admin"),
            "user still in {pid}: {:?}",
            project.users
        );
    }
    h
}

#[tokio::test]
async fn parallel_cascade_covers_all_projects_despite_element_failure() {
    let h = run_cascade_with_poisoned_element(FanOutMode::Parallel).await;
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn sequential_cascade_covers_all_projects_despite_element_failure() {
    let h = run_cascade_with_poisoned_element(FanOutMode::Sequential).await;
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn member_deletion_does_not_cascade() {
    let h = start(FanOutMode::Parallel).await;
    h.services
        .users
        .upsert(UserRecord::new("u-member", UserRole::Member))
        .await
        .expect("seed user");
    h.services
        .projects
        .upsert(ProjectRecord::new("proj-1", "alpha", vec!["u-member".into()]))
        .await
        .expect("seed project");

    let command = Command::DeleteUser {
        command_id: "cmd-member".into(),
        user_id: "u-member".into(),
    };
    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");

    assert_eq!(result.state, CommandState::Completed);
    assert_eq!(result.value.expect("summary")["cascaded_projects"], 0);

    // Project membership untouched for plain members.
    let project = h.services.projects.get("proj-1").await.expect("get").expect("present");
    assert_eq!(project.users, vec!["u-member".to_string()]);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn deleting_an_unknown_user_fails_cleanly() {
    let h = start(FanOutMode::Parallel).await;
    let command = Command::DeleteUser {
        command_id: "cmd-ghost".into(),
        user_id: "u-ghost".into(),
    };
    h.client.submit_command(&command).await.expect("submit");
    let result = h
        .client
        .wait_for_command_result(&command, WAIT)
        .await
        .expect("terminal envelope");
    assert_eq!(result.state, CommandState::Failed);
    assert!(result.errors[0].contains("u-ghost"));
    h.runtime.shutdown().await;
}
