use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use stockflow_core::TenantId;
use stockflow_events::{EventRecord, SnapshotMetadata};

/// Event log operation error.
///
/// These are **infrastructure errors** (storage, ordering, isolation). A
/// dispatch that hits one is rejected as a whole: nothing was appended, the
/// connection sequence is unchanged, and the caller may retry.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// Another record already holds this sequence, or the append skipped one.
    #[error("sequence conflict: {0}")]
    Conflict(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Replay found a hole in the record sequence.
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// A replay target rejected a record.
    #[error("replay of record {sequence} into '{target}' failed: {reason}")]
    Replay {
        sequence: u64,
        target: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// A snapshot as the log stores it: metadata plus an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub metadata: SnapshotMetadata,
    pub body: JsonValue,
}

/// Live stream of records appended to one tenant partition.
///
/// Records arrive in sequence order, starting after the position given to
/// [`EventLog::subscribe`]. Dropping the feed stops the background reader.
#[derive(Debug)]
pub struct ChangeFeed {
    receiver: mpsc::Receiver<EventRecord>,
    reader: JoinHandle<()>,
}

impl ChangeFeed {
    pub fn new(receiver: mpsc::Receiver<EventRecord>, reader: JoinHandle<()>) -> Self {
        Self { receiver, reader }
    }

    /// Next record, or `None` once the log side has gone away.
    pub async fn next(&mut self) -> Option<EventRecord> {
        self.receiver.recv().await
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Append-only, tenant-partitioned event log.
///
/// Implementations must:
/// - reject an append whose `sequence` is not `latest + 1` for its partition
/// - return records in ascending sequence order
/// - never return records from another partition
/// - keep the tenant marker (the single root document naming the active tenant)
///   separate from partition data
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, record: &EventRecord) -> Result<(), EventLogError>;

    /// Records of `tenant` with `sequence > after`, in order.
    async fn load_after(&self, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError>;

    async fn latest_sequence(&self, tenant: TenantId) -> Result<u64, EventLogError>;

    async fn subscribe(&self, tenant: TenantId, after: u64) -> Result<ChangeFeed, EventLogError>;

    async fn tenant_marker(&self) -> Result<Option<TenantId>, EventLogError>;

    async fn set_tenant_marker(&self, tenant: TenantId) -> Result<(), EventLogError>;

    /// Delete every record and snapshot of `tenant`. Returns the number of records removed.
    async fn purge_partition(&self, tenant: TenantId) -> Result<u64, EventLogError>;

    async fn store_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), EventLogError>;

    async fn load_latest_snapshot(&self, tenant: TenantId) -> Result<Option<StoredSnapshot>, EventLogError>;
}

#[async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        (**self).append(record).await
    }

    async fn load_after(&self, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError> {
        (**self).load_after(tenant, after).await
    }

    async fn latest_sequence(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        (**self).latest_sequence(tenant).await
    }

    async fn subscribe(&self, tenant: TenantId, after: u64) -> Result<ChangeFeed, EventLogError> {
        (**self).subscribe(tenant, after).await
    }

    async fn tenant_marker(&self) -> Result<Option<TenantId>, EventLogError> {
        (**self).tenant_marker().await
    }

    async fn set_tenant_marker(&self, tenant: TenantId) -> Result<(), EventLogError> {
        (**self).set_tenant_marker(tenant).await
    }

    async fn purge_partition(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        (**self).purge_partition(tenant).await
    }

    async fn store_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), EventLogError> {
        (**self).store_snapshot(snapshot).await
    }

    async fn load_latest_snapshot(&self, tenant: TenantId) -> Result<Option<StoredSnapshot>, EventLogError> {
        (**self).load_latest_snapshot(tenant).await
    }
}
