//! Where materialized state lives between restarts.
//!
//! The event log stays the source of truth; a backend only shortens replay.
//! Every batch produced by one `apply` is written in a single call, and
//! implementations must make that call atomic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::instrument;

use stockflow_core::{PathValue, StoreState, TenantId};

use super::apply::PathWrite;

#[derive(Debug, Error)]
pub enum StoreBackendError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Persisted state of `store`, if any was written before.
    async fn load(&self, store: &str) -> Result<Option<StoreState>, StoreBackendError>;

    /// Persist the final values of one batch atomically.
    async fn write_batch(&self, store: &str, sequence: u64, writes: &[PathWrite]) -> Result<(), StoreBackendError>;

    /// Replace everything persisted for `store` (init with reset, snapshot restore).
    async fn replace(&self, store: &str, state: &StoreState) -> Result<(), StoreBackendError>;
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend + ?Sized,
{
    async fn load(&self, store: &str) -> Result<Option<StoreState>, StoreBackendError> {
        (**self).load(store).await
    }

    async fn write_batch(&self, store: &str, sequence: u64, writes: &[PathWrite]) -> Result<(), StoreBackendError> {
        (**self).write_batch(store, sequence, writes).await
    }

    async fn replace(&self, store: &str, state: &StoreState) -> Result<(), StoreBackendError> {
        (**self).replace(store, state).await
    }
}

/// In-memory backend for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStoreBackend {
    stores: RwLock<HashMap<String, StoreState>>,
}

impl InMemoryStoreBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreBackendError {
        StoreBackendError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl StoreBackend for InMemoryStoreBackend {
    async fn load(&self, store: &str) -> Result<Option<StoreState>, StoreBackendError> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.get(store).cloned())
    }

    async fn write_batch(&self, store: &str, _sequence: u64, writes: &[PathWrite]) -> Result<(), StoreBackendError> {
        let mut stores = self.stores.write().map_err(|_| Self::poisoned())?;
        let state = stores.entry(store.to_string()).or_default();
        for write in writes {
            state.set_path(&write.slice, &write.path, write.value.clone());
        }
        Ok(())
    }

    async fn replace(&self, store: &str, state: &StoreState) -> Result<(), StoreBackendError> {
        let mut stores = self.stores.write().map_err(|_| Self::poisoned())?;
        stores.insert(store.to_string(), state.clone());
        Ok(())
    }
}

/// Postgres backend: one row per `(tenant, store, slice, path)`.
#[derive(Debug, Clone)]
pub struct PostgresStoreBackend {
    pool: Arc<PgPool>,
    tenant: TenantId,
}

impl PostgresStoreBackend {
    pub fn new(pool: PgPool, tenant: TenantId) -> Self {
        Self {
            pool: Arc::new(pool),
            tenant,
        }
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreBackendError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS materialized_state (
                tenant_id    UUID        NOT NULL,
                store        TEXT        NOT NULL,
                slice        TEXT        NOT NULL,
                path         TEXT        NOT NULL,
                value        JSONB       NOT NULL,
                log_sequence BIGINT      NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tenant_id, store, slice, path)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PostgresStoreBackend {
    #[instrument(skip(self), fields(tenant_id = %self.tenant), err)]
    async fn load(&self, store: &str) -> Result<Option<StoreState>, StoreBackendError> {
        let rows = sqlx::query(
            r#"
            SELECT slice, path, value
            FROM materialized_state
            WHERE tenant_id = $1 AND store = $2
            "#,
        )
        .bind(self.tenant.as_uuid())
        .bind(store)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("load", e))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut state = StoreState::default();
        for row in rows {
            let slice: String = row.try_get("slice").map_err(|e| storage("load", e))?;
            let path: String = row.try_get("path").map_err(|e| storage("load", e))?;
            let value: serde_json::Value = row.try_get("value").map_err(|e| storage("load", e))?;
            let value: PathValue =
                serde_json::from_value(value).map_err(|e| StoreBackendError::Serialization(e.to_string()))?;
            state.set_path(&slice, &path, value);
        }
        Ok(Some(state))
    }

    #[instrument(
        skip(self, writes),
        fields(tenant_id = %self.tenant, write_count = writes.len()),
        err
    )]
    async fn write_batch(&self, store: &str, sequence: u64, writes: &[PathWrite]) -> Result<(), StoreBackendError> {
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin_transaction", e))?;

        for write in writes {
            let value =
                serde_json::to_value(&write.value).map_err(|e| StoreBackendError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO materialized_state (tenant_id, store, slice, path, value, log_sequence)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (tenant_id, store, slice, path)
                DO UPDATE SET
                    value = EXCLUDED.value,
                    log_sequence = EXCLUDED.log_sequence,
                    updated_at = NOW()
                "#,
            )
            .bind(self.tenant.as_uuid())
            .bind(store)
            .bind(&write.slice)
            .bind(&write.path)
            .bind(&value)
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("upsert_path", e))?;
        }

        tx.commit().await.map_err(|e| storage("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self, state), fields(tenant_id = %self.tenant), err)]
    async fn replace(&self, store: &str, state: &StoreState) -> Result<(), StoreBackendError> {
        let sequence = state
            .path(stockflow_core::CONTROL_SLICE, stockflow_core::LOG_SEQUENCE)
            .and_then(|v| match v {
                PathValue::Counter(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(0);

        let mut tx = self.pool.begin().await.map_err(|e| storage("begin_transaction", e))?;

        sqlx::query("DELETE FROM materialized_state WHERE tenant_id = $1 AND store = $2")
            .bind(self.tenant.as_uuid())
            .bind(store)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("clear_store", e))?;

        for (slice, slice_state) in state.slices() {
            for (path, value) in slice_state.paths() {
                let value =
                    serde_json::to_value(value).map_err(|e| StoreBackendError::Serialization(e.to_string()))?;
                sqlx::query(
                    r#"
                    INSERT INTO materialized_state (tenant_id, store, slice, path, value, log_sequence)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(self.tenant.as_uuid())
                .bind(store)
                .bind(slice)
                .bind(path)
                .bind(&value)
                .bind(sequence)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage("insert_path", e))?;
            }
        }

        tx.commit().await.map_err(|e| storage("commit_transaction", e))?;
        Ok(())
    }
}

fn storage(operation: &str, err: sqlx::Error) -> StoreBackendError {
    StoreBackendError::Storage(format!("sqlx error in {operation}: {err}"))
}
