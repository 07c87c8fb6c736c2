//! Activity implementations: the only place side effects happen.
//!
//! Activities speak JSON strings at the engine boundary and typed records
//! inside. Repository failures map onto the transient/permanent split so the
//! workflow-level retry policy can tell them apart.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::data::{
    InMemoryRepository, ProjectRecord, ProviderRecord, Repository, RepositoryError, UserRecord,
};
use crate::deploy::{ArtifactsProvider, DeployError, DeploymentTemplate, NullStorageArtifactsProvider};
use crate::retry::transient;
use crate::runtime::ActivityRegistry;

/// Activity names shared by workflows and the registry.
pub mod names {
    pub const PROVIDER_GET: &str = "ProviderGet";
    pub const PROVIDER_UPSERT: &str = "ProviderUpsert";
    pub const PROVIDER_REGISTER: &str = "ProviderRegister";
    pub const USER_DELETE: &str = "UserDelete";
    pub const PROJECTS_LIST: &str = "ProjectsList";
    pub const PROJECT_USER_DELETE: &str = "ProjectUserDelete";
    pub const DEPLOYMENT_ARTIFACTS_UPLOAD: &str = "DeploymentArtifactsUpload";
}

/// External dependencies the activities close over.
#[derive(Clone)]
pub struct Services {
    pub providers: Arc<dyn Repository<ProviderRecord>>,
    pub projects: Arc<dyn Repository<ProjectRecord>>,
    pub users: Arc<dyn Repository<UserRecord>>,
    pub artifacts: Arc<dyn ArtifactsProvider>,
}

impl Services {
    pub fn in_memory() -> Self {
        Self {
            providers: InMemoryRepository::new(),
            projects: InMemoryRepository::new(),
            users: InMemoryRepository::new(),
            artifacts: Arc::new(NullStorageArtifactsProvider),
        }
    }
}

/// Cascade element payload: remove one user from one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUserRef {
    pub project_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentUpload {
    pub deployment_id: String,
    pub template: DeploymentTemplate,
}

fn repo_err(e: RepositoryError) -> String {
    if e.is_transient() {
        transient(e.to_string())
    } else {
        e.to_string()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialize: {e}"))
}

fn decode<'a, T: Deserialize<'a>>(input: &'a str) -> Result<T, String> {
    serde_json::from_str(input).map_err(|e| format!("malformed activity input: {e}"))
}

pub fn activity_registry(services: Services) -> ActivityRegistry {
    let builder = ActivityRegistry::builder();

    let s = services.clone();
    let builder = builder.register(names::PROVIDER_GET, move |_ctx, id: String| {
        let s = s.clone();
        async move {
            let found = s.providers.get(&id).await.map_err(repo_err)?;
            encode(&found)
        }
    });

    let s = services.clone();
    let builder = builder.register(names::PROVIDER_UPSERT, move |ctx, input: String| {
        let s = s.clone();
        async move {
            let record: ProviderRecord = decode(&input)?;
            ctx.trace_info(format!("upserting provider '{}'", record.id));
            let stored = s.providers.upsert(record).await.map_err(repo_err)?;
            encode(&stored)
        }
    });

    let builder = builder.register(names::PROVIDER_REGISTER, move |ctx, input: String| async move {
        let mut record: ProviderRecord = decode(&input)?;
        ctx.trace_info(format!("registering provider '{}' at {}", record.id, record.location));
        record.properties.insert(
            "registrationEndpoint".into(),
            json!(format!("{}/register", record.location)),
        );
        record
            .properties
            .insert("principalId".into(), json!(uuid::Uuid::new_v4().to_string()));
        encode(&record)
    });

    let s = services.clone();
    let builder = builder.register(names::USER_DELETE, move |ctx, user_id: String| {
        let s = s.clone();
        async move {
            let removed = s.users.remove(&user_id).await.map_err(repo_err)?;
            if removed.is_none() {
                ctx.trace_warn(format!("user '{user_id}' was not present"));
            }
            encode(&removed)
        }
    });

    let s = services.clone();
    let builder = builder.register(names::PROJECTS_LIST, move |_ctx, user_id: String| {
        let s = s.clone();
        async move {
            let projects = s.projects.list().await.map_err(repo_err)?;
            let ids: Vec<String> = projects
                .into_iter()
                .filter(|p| p.users.iter().any(|u| u == &user_id))
                .map(|p| p.id)
                .collect();
            encode(&ids)
        }
    });

    let s = services.clone();
    let builder = builder.register(names::PROJECT_USER_DELETE, move |ctx, input: String| {
        let s = s.clone();
        async move {
            let item: ProjectUserRef = decode(&input)?;
            let mut project = s
                .projects
                .get(&item.project_id)
                .await
                .map_err(repo_err)?
                .ok_or_else(|| format!("project '{}' not found", item.project_id))?;
            project.users.retain(|u| u != &item.user_id);
            s.projects.upsert(project).await.map_err(repo_err)?;
            ctx.trace_info(format!(
                "removed user '{}' from project '{}'",
                item.user_id, item.project_id
            ));
            encode(&item)
        }
    });

    let s = services;
    builder
        .register(names::DEPLOYMENT_ARTIFACTS_UPLOAD, move |_ctx, input: String| {
            let s = s.clone();
            async move {
                let upload: DeploymentUpload = decode(&input)?;
                let container = s
                    .artifacts
                    .upload(&upload.deployment_id, &upload.template)
                    .await
                    .map_err(|e| match e {
                        DeployError::Storage(msg) => transient(msg),
                        unsupported => unsupported.to_string(),
                    })?;
                encode(&container)
            }
        })
        .build()
}
