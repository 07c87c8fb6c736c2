//! Deployment artifact handling at the interface boundary.
//!
//! The engine treats artifact storage as an opaque activity dependency: the
//! contract is `upload`/`download`, nothing more. The no-storage
//! implementation covers providers without an artifact store — legal as long
//! as the template set carries no linked templates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A deployment template plus the linked templates it references by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    pub template: serde_json::Value,
    #[serde(default)]
    pub linked_templates: Vec<LinkedTemplate>,
}

impl DeploymentTemplate {
    pub fn new(template: serde_json::Value) -> Self {
        Self {
            template,
            linked_templates: Vec::new(),
        }
    }

    pub fn with_linked(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.linked_templates.push(LinkedTemplate {
            name: name.into(),
            content: content.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedTemplate {
    pub name: String,
    pub content: String,
}

/// Where uploaded artifacts ended up. Both fields are absent for providers
/// without artifact storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsContainer {
    pub location: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Fatal for the command; surfaced directly in the result envelope.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("artifact storage failure: {0}")]
    Storage(String),
}

/// Opaque artifact store consumed by deployment activities.
#[async_trait]
pub trait ArtifactsProvider: Send + Sync {
    async fn upload(&self, deployment_id: &str, template: &DeploymentTemplate)
        -> Result<ArtifactsContainer, DeployError>;
    async fn download(&self, deployment_id: &str, artifact_name: &str) -> Result<Option<String>, DeployError>;
}

/// Artifacts provider for deployments without a backing store. Uploading a
/// template set with zero linked templates yields an empty container;
/// anything that would actually need storage is unsupported.
#[derive(Debug, Default)]
pub struct NullStorageArtifactsProvider;

#[async_trait]
impl ArtifactsProvider for NullStorageArtifactsProvider {
    async fn upload(
        &self,
        _deployment_id: &str,
        template: &DeploymentTemplate,
    ) -> Result<ArtifactsContainer, DeployError> {
        if template.linked_templates.is_empty() {
            Ok(ArtifactsContainer::default())
        } else {
            Err(DeployError::Unsupported(
                "no-storage artifacts provider does not support linked templates".to_string(),
            ))
        }
    }

    async fn download(&self, _deployment_id: &str, _artifact_name: &str) -> Result<Option<String>, DeployError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_template_set_uploads_to_placeholder_container() {
        let provider = NullStorageArtifactsProvider;
        let template = DeploymentTemplate::new(serde_json::json!({"resources": []}));
        let container = provider.upload("deploy-1", &template).await.expect("upload succeeds");
        assert_eq!(container.location, None);
        assert_eq!(container.token, None);
    }

    #[tokio::test]
    async fn linked_templates_are_unsupported_without_storage() {
        let provider = NullStorageArtifactsProvider;
        let template = DeploymentTemplate::new(serde_json::json!({"resources": []}))
            .with_linked("network.json", "{}");
        let err = provider.upload("deploy-1", &template).await.expect_err("must fail");
        assert!(matches!(err, DeployError::Unsupported(_)));
    }

    #[tokio::test]
    async fn download_is_always_absent() {
        let provider = NullStorageArtifactsProvider;
        let got = provider.download("deploy-1", "network.json").await.expect("download");
        assert_eq!(got, None);
    }
}
