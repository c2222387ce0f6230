//! Materialized, schema-typed state driven by the event log.
//!
//! A [`StateStore`] is mutated only through [`StateStore::apply`] (or its two
//! halves, `stage` and `commit`). Everything it holds can be rebuilt by
//! replaying the log from sequence 0.

pub mod apply;
pub mod backend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use stockflow_core::{
    CONTROL_SLICE, LOG_SEQUENCE, SchemaDefinition, StateChanges, StateError, StateResult, StoreState,
};
use stockflow_events::{ApplyInfo, EventRecord};

use crate::event_log::{EventLogError, ReplayTarget};

pub use apply::{PathWrite, StagedBatch, stage};
pub use backend::{InMemoryStoreBackend, PostgresStoreBackend, StoreBackend, StoreBackendError};

/// Per-slice apply outcomes of one batch.
pub type ApplyInfos = BTreeMap<String, ApplyInfo>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backend(#[from] StoreBackendError),

    #[error("invalid snapshot for store '{store}': {reason}")]
    Snapshot { store: String, reason: String },
}

pub struct StateStore {
    name: String,
    schema: Arc<SchemaDefinition>,
    state: StoreState,
    backend: Arc<dyn StoreBackend>,
}

impl core::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateStore")
            .field("name", &self.name)
            .field("log_sequence", &self.log_sequence())
            .finish()
    }
}

impl StateStore {
    /// Open a store, hydrating from whatever the backend already holds.
    pub async fn open(
        name: impl Into<String>,
        schema: Arc<SchemaDefinition>,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        let mut state = match backend.load(&name).await? {
            Some(state) => state,
            None => StoreState::initial(&schema),
        };
        state.fill_missing(&schema);

        let store = Self {
            name,
            schema,
            state,
            backend,
        };
        info!(store = %store.name, log_sequence = store.log_sequence(), "state store opened");
        Ok(store)
    }

    /// A fresh store backed by memory only.
    pub fn in_memory(name: impl Into<String>, schema: Arc<SchemaDefinition>) -> Self {
        let state = StoreState::initial(&schema);
        Self {
            name: name.into(),
            schema,
            state,
            backend: Arc::new(InMemoryStoreBackend::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    /// Sequence of the last record applied to this store.
    pub fn log_sequence(&self) -> u64 {
        self.state
            .slice(CONTROL_SLICE)
            .and_then(|s| s.counter(LOG_SEQUENCE))
            .map(|n| n.max(0) as u64)
            .unwrap_or(0)
    }

    /// (Re)initialize every declared path.
    ///
    /// With `reset`, all state is dropped back to type defaults (empty LIST,
    /// zero COUNTER, declared HASH). Without it, only missing paths are filled.
    pub async fn init_store(&mut self, reset: bool) -> Result<(), StoreError> {
        if reset {
            let fresh = StoreState::initial(&self.schema);
            self.backend.replace(&self.name, &fresh).await?;
            self.state = fresh;
            info!(store = %self.name, "state store reset");
        } else {
            self.state.fill_missing(&self.schema);
        }
        Ok(())
    }

    /// The whole LIST, one LIST item by id, the HASH, or the COUNTER value.
    pub fn get_value(&self, slice: &str, path: &str, idx: Option<u64>) -> StateResult<Option<JsonValue>> {
        apply::read_value(&self.state, &self.schema, slice, path, idx)
    }

    /// Validate `changes` without touching the store.
    pub fn stage(&self, sequence: u64, changes: &StateChanges) -> StateResult<StagedBatch> {
        stage(&self.schema, &self.state, sequence, changes)
    }

    /// Write a staged batch to the backend, then make it current.
    ///
    /// The in-memory state advances even if the backend write fails: the
    /// record is already in the log and a reopen replays it.
    pub async fn commit(&mut self, staged: StagedBatch) -> Result<ApplyInfos, StoreError> {
        let written = self
            .backend
            .write_batch(&self.name, staged.sequence, &staged.writes)
            .await;
        staged.apply_to(&mut self.state);
        debug!(store = %self.name, sequence = staged.sequence, writes = staged.writes.len(), "batch committed");
        written?;
        Ok(staged.info)
    }

    /// Apply one record's changes. Already-applied sequences are skipped.
    pub async fn apply(&mut self, sequence: u64, changes: &StateChanges) -> Result<ApplyInfos, StoreError> {
        if sequence <= self.log_sequence() {
            debug!(store = %self.name, sequence, "skipping already applied record");
            return Ok(ApplyInfos::new());
        }
        let staged = self.stage(sequence, changes)?;
        self.commit(staged).await
    }

    pub fn to_snapshot(&self) -> StoreState {
        self.state.clone()
    }

    /// Replace the current state with a snapshot taken earlier.
    pub async fn restore_snapshot(&mut self, mut state: StoreState) -> Result<(), StoreError> {
        for (slice, _) in state.slices() {
            if self.schema.slice(slice).is_err() {
                return Err(StoreError::Snapshot {
                    store: self.name.clone(),
                    reason: format!("unknown slice '{slice}'"),
                });
            }
        }
        state.fill_missing(&self.schema);
        self.backend.replace(&self.name, &state).await?;
        self.state = state;
        Ok(())
    }
}

/// Shared handle to a store.
///
/// Writers take the write lock only while holding the connection mutex, so
/// readers never observe a half-applied dispatch.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    name: String,
    inner: Arc<RwLock<StateStore>>,
}

impl StoreHandle {
    pub fn new(store: StateStore) -> Self {
        Self {
            name: store.name().to_string(),
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, StateStore> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, StateStore> {
        self.inner.write().await
    }

    pub async fn get_value(&self, slice: &str, path: &str, idx: Option<u64>) -> StateResult<Option<JsonValue>> {
        self.inner.read().await.get_value(slice, path, idx)
    }
}

#[async_trait]
impl ReplayTarget for StoreHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_record(&self, record: &EventRecord) -> Result<(), EventLogError> {
        let Some(changes) = record.changes_for(&self.name) else {
            return Ok(());
        };
        let mut store = self.inner.write().await;
        store
            .apply(record.sequence, changes)
            .await
            .map(|_| ())
            .map_err(|e| EventLogError::Replay {
                sequence: record.sequence,
                target: self.name.clone(),
                reason: e.to_string(),
            })
    }
}
