//! Point-in-time checkpoints that bound replay distance.
//!
//! A checkpoint is never authoritative: it is taken under the connection
//! mutex, so it reflects exactly the records up to `event_seq`, and replay
//! continues from there.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use stockflow_core::{StoreState, TenantId};
use stockflow_events::{EventBus, OutboundEvent, ProcessingState, SnapshotMetadata};

use crate::event_log::{EventLogConnection, EventLogError, StoredSnapshot};
use crate::state_store::{StoreError, StoreHandle};
use crate::workers::WorkerHandle;
use crate::workflow::ProcessingHandle;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Log(#[from] EventLogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("snapshot {name} has no state for store '{store}'")]
    MissingStore { name: String, store: String },

    #[error("snapshot {name} belongs to tenant {found}")]
    TenantMismatch { name: String, found: TenantId },
}

/// Serialized body of one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub tenant: TenantId,
    pub event_seq: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub stores: BTreeMap<String, StoreState>,
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessingState>,
}

/// Takes and restores checkpoints for a fixed set of stores and processors.
pub struct Snapshotter {
    connection: Arc<EventLogConnection>,
    stores: Vec<StoreHandle>,
    processors: Vec<ProcessingHandle>,
    publisher: Option<Arc<dyn EventBus<OutboundEvent>>>,
}

impl core::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("stores", &self.stores.iter().map(StoreHandle::name).collect::<Vec<_>>())
            .field("processors", &self.processors.iter().map(ProcessingHandle::name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Snapshotter {
    pub fn new(connection: Arc<EventLogConnection>) -> Self {
        Self {
            connection,
            stores: Vec::new(),
            processors: Vec::new(),
            publisher: None,
        }
    }

    pub fn with_store(mut self, store: StoreHandle) -> Self {
        self.stores.push(store);
        self
    }

    pub fn with_processor(mut self, processing: ProcessingHandle) -> Self {
        self.processors.push(processing);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventBus<OutboundEvent>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Capture every store and processor at the current sequence.
    ///
    /// Returns `None` when nothing has been applied yet.
    pub async fn take_snapshot(&self) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        let lock = self.connection.acquire().await;
        let event_seq = lock.sequence();
        if event_seq == 0 {
            return Ok(None);
        }

        let metadata = SnapshotMetadata::new(self.connection.tenant(), event_seq, Utc::now());
        let mut checkpoint = Checkpoint {
            tenant: metadata.tenant,
            event_seq,
            name: metadata.name.clone(),
            created_at: metadata.created_at,
            stores: BTreeMap::new(),
            processors: BTreeMap::new(),
        };
        for store in &self.stores {
            let state = store.read().await.to_snapshot();
            checkpoint.stores.insert(store.name().to_string(), state);
        }
        for processing in &self.processors {
            checkpoint
                .processors
                .insert(processing.name().to_string(), processing.snapshot().await);
        }

        let body = serde_json::to_value(&checkpoint).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        self.connection
            .log()
            .store_snapshot(&StoredSnapshot {
                metadata: metadata.clone(),
                body: body.clone(),
            })
            .await?;
        drop(lock);

        info!(tenant = %metadata.tenant, event_seq, name = %metadata.name, "snapshot stored");

        if let Some(publisher) = &self.publisher {
            let event = OutboundEvent::Snapshot {
                metadata: metadata.clone(),
                snapshot: body,
            };
            if let Err(err) = publisher.publish(event) {
                warn!(event_seq, error = %err, "failed to publish snapshot");
            }
        }
        Ok(Some(metadata))
    }

    /// Hydrate from the latest snapshot and move the connection to its sequence.
    ///
    /// Does nothing if there is no snapshot or the connection is already past it.
    pub async fn restore_latest(&self) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        let mut lock = self.connection.acquire().await;
        let Some(stored) = self.connection.log().load_latest_snapshot(self.connection.tenant()).await? else {
            return Ok(None);
        };
        if stored.metadata.event_seq <= lock.sequence() {
            return Ok(None);
        }

        let mut checkpoint: Checkpoint =
            serde_json::from_value(stored.body).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        if checkpoint.tenant != self.connection.tenant() {
            return Err(SnapshotError::TenantMismatch {
                name: checkpoint.name,
                found: checkpoint.tenant,
            });
        }
        for store in &self.stores {
            if !checkpoint.stores.contains_key(store.name()) {
                return Err(SnapshotError::MissingStore {
                    name: checkpoint.name,
                    store: store.name().to_string(),
                });
            }
        }

        for store in &self.stores {
            if let Some(state) = checkpoint.stores.remove(store.name()) {
                store.write().await.restore_snapshot(state).await?;
            }
        }
        for processing in &self.processors {
            let state = checkpoint.processors.remove(processing.name()).unwrap_or_default();
            processing.restore(state, checkpoint.event_seq).await;
        }
        lock.advance(checkpoint.event_seq);

        info!(tenant = %stored.metadata.tenant, event_seq = checkpoint.event_seq, name = %checkpoint.name, "restored from snapshot");
        Ok(Some(stored.metadata))
    }
}

/// How often to snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Take one every `every` sequences; 0 disables.
    pub every: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { every: 500 }
    }
}

impl SnapshotPolicy {
    pub fn due(&self, last_snapshot: u64, current: u64) -> bool {
        self.every > 0 && current >= last_snapshot.saturating_add(self.every)
    }
}

/// Check the policy every `interval` and snapshot when due.
pub fn spawn_snapshotter(snapshotter: Arc<Snapshotter>, policy: SnapshotPolicy, interval: Duration) -> WorkerHandle {
    let last = Arc::new(tokio::sync::Mutex::new(0u64));
    WorkerHandle::every("snapshotter", interval, move || {
        let snapshotter = Arc::clone(&snapshotter);
        let last = Arc::clone(&last);
        async move {
            let mut last = last.lock().await;
            let current = snapshotter.connection.sequence().await;
            if !policy.due(*last, current) {
                return;
            }
            match snapshotter.take_snapshot().await {
                Ok(Some(metadata)) => *last = metadata.event_seq,
                Ok(None) => {}
                Err(err) => warn!(error = %err, "snapshot failed"),
            }
        }
    })
}
