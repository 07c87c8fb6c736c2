//! Externally persisted records and the repository contract.
//!
//! The engine core never touches record storage directly; activities wrap
//! repository calls, and repository failures surface as activity failures
//! subject to the retry policy. The in-memory repository here backs the
//! shipped activities and the test suites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A pluggable external integration, addressable by stable id. Owned by the
/// provider directory, mutated only through lock-gated activities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    /// Endpoint the activity layer dispatches provider calls to.
    pub location: String,
    /// Set by the registration workflow once the provider has registered.
    pub registered_at_ms: Option<u64>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ProviderRecord {
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            registered_at_ms: None,
            properties: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    /// Ids of the users that belong to this project.
    pub users: Vec<String>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            users,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub role: UserRole,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self { id: id.into(), role }
    }
}

/// Identity accessor shared by all repository documents.
pub trait Doc {
    fn doc_id(&self) -> &str;
}

impl Doc for ProviderRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl Doc for ProjectRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl Doc for UserRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Worth retrying: timeouts, connection drops, throttling.
    #[error("transient repository failure: {0}")]
    Transient(String),
    #[error("repository failure: {0}")]
    Permanent(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }
}

/// Document store contract consumed by activities.
#[async_trait]
pub trait Repository<T>: Send + Sync
where
    T: Send + Sync,
{
    async fn get(&self, id: &str) -> Result<Option<T>, RepositoryError>;
    /// Remove and return the document, or `None` if it was absent.
    async fn remove(&self, id: &str) -> Result<Option<T>, RepositoryError>;
    async fn upsert(&self, doc: T) -> Result<T, RepositoryError>;
    async fn list(&self) -> Result<Vec<T>, RepositoryError>;
}

/// In-memory repository used by the shipped activities and tests.
#[derive(Default)]
pub struct InMemoryRepository<T> {
    docs: Mutex<HashMap<String, T>>,
}

impl<T: Doc + Clone + Send + Sync> InMemoryRepository<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            docs: Mutex::new(HashMap::new()),
        })
    }

    /// Seed helper for tests and wiring.
    pub async fn put(&self, doc: T) {
        self.docs.lock().await.insert(doc.doc_id().to_string(), doc);
    }
}

#[async_trait]
impl<T: Doc + Clone + Send + Sync> Repository<T> for InMemoryRepository<T> {
    async fn get(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        Ok(self.docs.lock().await.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        Ok(self.docs.lock().await.remove(id))
    }

    async fn upsert(&self, doc: T) -> Result<T, RepositoryError> {
        self.docs.lock().await.insert(doc.doc_id().to_string(), doc.clone());
        Ok(doc)
    }

    async fn list(&self) -> Result<Vec<T>, RepositoryError> {
        Ok(self.docs.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_remove_roundtrips() {
        let repo = InMemoryRepository::new();
        let stored = repo
            .upsert(ProviderRecord::new("prov-a", "https://providers.example.com/a"))
            .await
            .expect("upsert");
        assert_eq!(stored.id, "prov-a");

        let fetched = repo.get("prov-a").await.expect("get");
        assert_eq!(fetched, Some(stored.clone()));

        let removed = repo.remove("prov-a").await.expect("remove");
        assert_eq!(removed, Some(stored));
        assert_eq!(repo.get("prov-a").await.expect("get"), None);
    }
}
