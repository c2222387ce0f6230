//! Postgres-backed event log.
//!
//! Records are stored whole as JSONB, keyed by `(tenant_id, sequence)`. The
//! primary key is what makes a second writer for the same partition fail
//! instead of silently interleaving.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventLogError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! The change feed polls for `sequence > last_seen`; the poll period comes from
//! `EngineConfig::feed_poll`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use stockflow_core::TenantId;
use stockflow_events::{EventRecord, SnapshotMetadata};

use super::r#trait::{ChangeFeed, EventLog, EventLogError, StoredSnapshot};

/// Postgres-backed append-only event log.
///
/// Every query carries `tenant_id` in its WHERE clause.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: Arc<PgPool>,
    feed_poll: Duration,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            feed_poll: Duration::from_millis(250),
        }
    }

    pub fn with_feed_poll(mut self, feed_poll: Duration) -> Self {
        self.feed_poll = feed_poll;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the log tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                tenant_id   UUID        NOT NULL,
                sequence    BIGINT      NOT NULL CHECK (sequence > 0),
                recorded_at TIMESTAMPTZ NOT NULL,
                record      JSONB       NOT NULL,
                PRIMARY KEY (tenant_id, sequence)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tenant_marker (
                id          SMALLINT    PRIMARY KEY CHECK (id = 1),
                tenant_id   UUID        NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS log_snapshots (
                tenant_id   UUID        NOT NULL,
                event_seq   BIGINT      NOT NULL,
                name        TEXT        NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL,
                body        JSONB       NOT NULL,
                PRIMARY KEY (tenant_id, event_seq)
            )
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(
        skip(self, record),
        fields(tenant_id = %record.partition_key, sequence = record.sequence),
        err
    )]
    async fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        let body = serde_json::to_value(record).map_err(|e| EventLogError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = latest_in_tx(&mut tx, record.partition_key).await?;
        if record.sequence != current + 1 {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventLogError::Conflict(format!(
                "expected sequence {}, got {}",
                current + 1,
                record.sequence
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO event_log (tenant_id, sequence, recorded_at, record)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.partition_key.as_uuid())
        .bind(record.sequence as i64)
        .bind(record.timestamp)
        .bind(&body)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_record", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn load_after(&self, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError> {
        fetch_after(&self.pool, tenant, after).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn latest_sequence(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS latest FROM event_log WHERE tenant_id = $1")
            .bind(tenant.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_sequence", e))?;
        let latest: i64 = row
            .try_get("latest")
            .map_err(|e| EventLogError::Storage(format!("failed to read latest sequence: {e}")))?;
        Ok(latest as u64)
    }

    async fn subscribe(&self, tenant: TenantId, after: u64) -> Result<ChangeFeed, EventLogError> {
        let pool = Arc::clone(&self.pool);
        let poll = self.feed_poll;
        let (tx, rx) = mpsc::channel(1024);

        let reader = tokio::spawn(async move {
            let mut last = after;
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let records = match fetch_after(&pool, tenant, last).await {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(%tenant, error = %err, "change feed poll failed");
                        continue;
                    }
                };
                if !records.is_empty() {
                    debug!(%tenant, count = records.len(), "change feed delivered records");
                }
                for record in records {
                    last = record.sequence;
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ChangeFeed::new(rx, reader))
    }

    async fn tenant_marker(&self) -> Result<Option<TenantId>, EventLogError> {
        let row = sqlx::query("SELECT tenant_id FROM tenant_marker WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tenant_marker", e))?;

        row.map(|row| {
            row.try_get::<uuid::Uuid, _>("tenant_id")
                .map(TenantId::from_uuid)
                .map_err(|e| EventLogError::Storage(format!("failed to read tenant marker: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn set_tenant_marker(&self, tenant: TenantId) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_marker (id, tenant_id)
            VALUES (1, $1)
            ON CONFLICT (id)
            DO UPDATE SET tenant_id = EXCLUDED.tenant_id, updated_at = NOW()
            "#,
        )
        .bind(tenant.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_tenant_marker", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn purge_partition(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let removed = sqlx::query("DELETE FROM event_log WHERE tenant_id = $1")
            .bind(tenant.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_records", e))?
            .rows_affected();

        sqlx::query("DELETE FROM log_snapshots WHERE tenant_id = $1")
            .bind(tenant.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_snapshots", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(removed)
    }

    #[instrument(
        skip(self, snapshot),
        fields(tenant_id = %snapshot.metadata.tenant, event_seq = snapshot.metadata.event_seq),
        err
    )]
    async fn store_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO log_snapshots (tenant_id, event_seq, name, created_at, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, event_seq)
            DO UPDATE SET name = EXCLUDED.name, created_at = EXCLUDED.created_at, body = EXCLUDED.body
            "#,
        )
        .bind(snapshot.metadata.tenant.as_uuid())
        .bind(snapshot.metadata.event_seq as i64)
        .bind(&snapshot.metadata.name)
        .bind(snapshot.metadata.created_at)
        .bind(&snapshot.body)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_snapshot", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn load_latest_snapshot(&self, tenant: TenantId) -> Result<Option<StoredSnapshot>, EventLogError> {
        let row = sqlx::query(
            r#"
            SELECT event_seq, name, created_at, body
            FROM log_snapshots
            WHERE tenant_id = $1
            ORDER BY event_seq DESC
            LIMIT 1
            "#,
        )
        .bind(tenant.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_latest_snapshot", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: sqlx::Error| EventLogError::Storage(format!("failed to read snapshot row: {e}"));
        let event_seq: i64 = row.try_get("event_seq").map_err(read)?;
        let name: String = row.try_get("name").map_err(read)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(read)?;
        let body: serde_json::Value = row.try_get("body").map_err(read)?;

        Ok(Some(StoredSnapshot {
            metadata: SnapshotMetadata {
                tenant,
                event_seq: event_seq as u64,
                name,
                created_at,
            },
            body,
        }))
    }
}

async fn latest_in_tx(tx: &mut Transaction<'_, Postgres>, tenant: TenantId) -> Result<u64, EventLogError> {
    let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS latest FROM event_log WHERE tenant_id = $1")
        .bind(tenant.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_latest_sequence", e))?;
    let latest: i64 = row
        .try_get("latest")
        .map_err(|e| EventLogError::Storage(format!("failed to read latest sequence: {e}")))?;
    Ok(latest as u64)
}

async fn fetch_after(pool: &PgPool, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError> {
    let rows = sqlx::query(
        r#"
        SELECT record
        FROM event_log
        WHERE tenant_id = $1 AND sequence > $2
        ORDER BY sequence ASC
        "#,
    )
    .bind(tenant.as_uuid())
    .bind(after as i64)
    .fetch_all(pool)
    .await
    .map_err(|e| map_sqlx_error("load_after", e))?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let body: serde_json::Value = row
            .try_get("record")
            .map_err(|e| EventLogError::Storage(format!("failed to read record column: {e}")))?;
        let record: EventRecord =
            serde_json::from_value(body).map_err(|e| EventLogError::Serialization(e.to_string()))?;
        if record.partition_key != tenant {
            return Err(EventLogError::TenantIsolation(format!(
                "record {} belongs to tenant {}",
                record.sequence, record.partition_key
            )));
        }
        records.push(record);
    }
    Ok(records)
}

/// Map SQLx errors to EventLogError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique or check violation: another writer took the sequence.
                Some("23505") | Some("23514") => EventLogError::Conflict(msg),
                _ => EventLogError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => EventLogError::Storage(format!("connection pool closed in {operation}")),
        _ => EventLogError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
