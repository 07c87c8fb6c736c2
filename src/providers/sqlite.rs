//! SQLite-backed provider with transactional commits.
//!
//! History rows and queue items live in one database, so a turn's commit
//! (history delta + dispatched items + consumed orchestrator item) is a
//! single transaction. Delayed visibility is a `visible_at_ms` column;
//! peek-locks are uuid tokens with a `locked_until_ms` lease, so an item
//! stranded by a crashed process is redelivered once its lease expires.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{Provider, ProviderError, QueueKind, WorkItem};
use crate::Event;

const DEFAULT_LOCK_LEASE_MS: i64 = 30_000;

pub struct SqliteProvider {
    pool: SqlitePool,
    lock_lease_ms: i64,
}

impl SqliteProvider {
    /// Open (or create) a database at `url`, e.g. `sqlite:/path/engine.db`.
    pub async fn new(url: &str) -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ProviderError::permanent("connect", format!("invalid sqlite url '{url}': {e}")))?
            .create_if_missing(true);
        Self::with_options(options).await
    }

    /// Fully in-memory database; the pool is pinned to one connection so the
    /// database lives as long as the provider.
    pub async fn new_in_memory() -> Result<Self, ProviderError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ProviderError::permanent("connect", e.to_string()))?;
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, ProviderError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Self::map_err("connect", e))?;
        let provider = Self {
            pool,
            lock_lease_ms: DEFAULT_LOCK_LEASE_MS,
        };
        provider.migrate().await?;
        Ok(provider)
    }

    /// Override the peek-lock lease duration.
    pub fn with_lock_lease(mut self, lease_ms: u64) -> Self {
        self.lock_lease_ms = lease_ms as i64;
        self
    }

    async fn migrate(&self) -> Result<(), ProviderError> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS instances (
                instance TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS history (
                instance TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (instance, seq)
            )",
            "CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                item TEXT NOT NULL,
                visible_at_ms INTEGER NOT NULL,
                lock_token TEXT,
                locked_until_ms INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_queue_visibility
                ON queue_items (queue, visible_at_ms)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::map_err("migrate", e))?;
        }
        Ok(())
    }

    fn map_err(operation: &str, e: sqlx::Error) -> ProviderError {
        let msg = e.to_string();
        if msg.contains("database is locked") || msg.contains("SQLITE_BUSY") {
            ProviderError::retryable(operation, format!("database locked: {msg}"))
        } else if msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY") {
            ProviderError::permanent(operation, format!("constraint violation: {msg}"))
        } else if msg.contains("connection") || msg.contains("timeout") {
            ProviderError::retryable(operation, format!("connection error: {msg}"))
        } else {
            ProviderError::retryable(operation, msg)
        }
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn encode(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item).map_err(|e| ProviderError::permanent(operation, format!("serialize: {e}")))
    }

    async fn insert_item(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        queue: QueueKind,
        item: &WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let payload = Self::encode("enqueue_work", item)?;
        let visible_at = Self::now_ms() + delay_ms.unwrap_or(0) as i64;
        // Idempotent enqueue: collapse identical pending payloads.
        let existing = sqlx::query("SELECT id FROM queue_items WHERE queue = ? AND item = ? AND lock_token IS NULL")
            .bind(queue.as_str())
            .bind(&payload)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Self::map_err("enqueue_work", e))?;
        if existing.is_some() {
            return Ok(());
        }
        sqlx::query("INSERT INTO queue_items (queue, item, visible_at_ms) VALUES (?, ?, ?)")
            .bind(queue.as_str())
            .bind(&payload)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::map_err("enqueue_work", e))?;
        Ok(())
    }

    async fn append_events(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        instance: &str,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        if events.is_empty() {
            return Ok(());
        }
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS max_seq FROM history WHERE instance = ?")
            .bind(instance)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Self::map_err("append", e))?;
        let mut seq: i64 = row.get::<i64, _>("max_seq");
        for event in events {
            seq += 1;
            let payload = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent("append", format!("serialize: {e}")))?;
            sqlx::query("INSERT INTO history (instance, seq, event) VALUES (?, ?, ?)")
                .bind(instance)
                .bind(seq)
                .bind(payload)
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::map_err("append", e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let rows = match sqlx::query("SELECT event FROM history WHERE instance = ? ORDER BY seq")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(instance, error = %e, "history read failed");
                return Vec::new();
            }
        };
        rows.iter()
            .filter_map(|row| serde_json::from_str(row.get::<String, _>("event").as_str()).ok())
            .collect()
    }

    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        sqlx::query("INSERT OR IGNORE INTO instances (instance, created_at_ms) VALUES (?, ?)")
            .bind(instance)
            .bind(Self::now_ms())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_err("create_instance", e))?;
        Ok(())
    }

    async fn instance_exists(&self, instance: &str) -> bool {
        sqlx::query("SELECT instance FROM instances WHERE instance = ?")
            .bind(instance)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    async fn list_instances(&self) -> Vec<String> {
        match sqlx::query("SELECT instance FROM instances ORDER BY instance")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(|r| r.get::<String, _>("instance")).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn enqueue_work(&self, queue: QueueKind, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        let mut tx = self.pool.begin().await.map_err(|e| Self::map_err("enqueue_work", e))?;
        Self::insert_item(&mut tx, queue, &item, delay_ms).await?;
        tx.commit().await.map_err(|e| Self::map_err("enqueue_work", e))
    }

    async fn dequeue_peek_lock(&self, queue: QueueKind) -> Option<(WorkItem, String)> {
        let mut tx = self.pool.begin().await.ok()?;
        let now = Self::now_ms();
        // An expired lease counts as unlocked; relocking under a fresh token
        // makes a late ack from the previous consumer miss.
        let row = sqlx::query(
            "SELECT id, item FROM queue_items
             WHERE queue = ? AND visible_at_ms <= ?
               AND (lock_token IS NULL OR locked_until_ms <= ?)
             ORDER BY id LIMIT 1",
        )
        .bind(queue.as_str())
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;

        let id: i64 = row.get("id");
        let payload: String = row.get("item");
        let token = uuid::Uuid::new_v4().to_string();
        sqlx::query("UPDATE queue_items SET lock_token = ?, locked_until_ms = ? WHERE id = ?")
            .bind(&token)
            .bind(now + self.lock_lease_ms)
            .bind(id)
            .execute(&mut *tx)
            .await
            .ok()?;
        tx.commit().await.ok()?;

        let item: WorkItem = serde_json::from_str(&payload).ok()?;
        Some((item, token))
    }

    async fn ack(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError> {
        sqlx::query("DELETE FROM queue_items WHERE queue = ? AND lock_token = ?")
            .bind(queue.as_str())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_err("ack", e))?;
        Ok(())
    }

    async fn abandon(&self, queue: QueueKind, token: &str) -> Result<(), ProviderError> {
        sqlx::query(
            "UPDATE queue_items SET lock_token = NULL, locked_until_ms = NULL, visible_at_ms = ?
             WHERE queue = ? AND lock_token = ?",
        )
            .bind(Self::now_ms())
            .bind(queue.as_str())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_err("abandon", e))?;
        Ok(())
    }

    async fn ack_orchestration_item(
        &self,
        token: &str,
        instance: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::map_err("ack_orchestration_item", e))?;

        Self::append_events(&mut tx, instance, &history_delta).await?;
        for item in &worker_items {
            Self::insert_item(&mut tx, QueueKind::Worker, item, None).await?;
        }
        for item in &timer_items {
            Self::insert_item(&mut tx, QueueKind::Timer, item, None).await?;
        }
        for item in &orchestrator_items {
            Self::insert_item(&mut tx, QueueKind::Orchestrator, item, None).await?;
        }
        sqlx::query("DELETE FROM queue_items WHERE queue = ? AND lock_token = ?")
            .bind(QueueKind::Orchestrator.as_str())
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_err("ack_orchestration_item", e))?;

        tx.commit().await.map_err(|e| Self::map_err("ack_orchestration_item", e))
    }

    async fn reset(&self) {
        for table in ["history", "instances", "queue_items"] {
            let _ = sqlx::query(&format!("DELETE FROM {table}")).execute(&self.pool).await;
        }
    }
}
