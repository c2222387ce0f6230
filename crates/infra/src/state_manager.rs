//! Dispatch cycle: action in, one log record out, stores advanced.
//!
//! ```text
//! Action (+ linked action, + processor checkpoint)
//!   ↓
//! 1. Acquire the connection mutex
//!   ↓
//! 2. Run each root reducer against its store's current state
//!   ↓
//! 3. Stage every store (validate on a copy; a schema violation aborts here)
//!   ↓
//! 4. Append one record at sequence + 1
//!   ↓
//! 5. Commit staged stores, record the checkpoint, advance the sequence
//!   ↓
//! 6. Release the mutex, publish `{type: "events"}`, merge infos
//! ```
//!
//! Failure semantics:
//! - A schema violation (step 3) or a log error (step 4) leaves everything
//!   untouched: no record, same sequence, same state. The caller may retry.
//! - A store backend failure after the append (step 5) is reported as
//!   [`DispatchError::Materialize`]. The record is durable and in-memory state
//!   already reflects it; reopening the store replays it.
//! - A failed publish is logged and never returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use stockflow_core::{StateChanges, StateError, StateResult, StoreState};
use stockflow_events::{
    Action, EventBus, EventRecord, OutboundEvent, ProcessorInfo, RESERVED_RECORD_KEYS, RootReducer, SliceInfos,
    absorb_apply,
};

use crate::event_log::{EventLogConnection, EventLogError};
use crate::state_store::{StateStore, StoreError, StoreHandle};
use crate::workflow::ProcessingHandle;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A reducer emitted an update the schema rejects. Nothing was written.
    #[error(transparent)]
    State(#[from] StateError),

    /// The log rejected the record. Nothing was written.
    #[error(transparent)]
    Log(#[from] EventLogError),

    /// Linked managers must serialize through one connection.
    #[error("state manager '{0}' is attached to a different connection")]
    ForeignConnection(String),

    #[error("state manager '{0}' appears twice in one dispatch")]
    DuplicateManager(String),

    /// The manager name collides with a record field.
    #[error("'{0}' is reserved and cannot name a state manager")]
    ReservedName(String),

    #[error("state manager '{manager}' was given store '{store}'")]
    StoreMismatch { manager: String, store: String },

    /// The record at `sequence` is in the log but the store backend failed.
    #[error("record {sequence} appended but store '{store}' failed to persist: {source}")]
    Materialize {
        sequence: u64,
        store: String,
        #[source]
        source: StoreError,
    },
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub sequence: u64,
    pub info: SliceInfos,
    pub linked_info: Option<SliceInfos>,
}

/// One state manager and the action it should reduce.
pub(crate) struct Participant<'a> {
    pub manager: &'a StateManager,
    pub action: &'a Action,
}

/// Workflow progress committed alongside the business change.
pub(crate) struct ProcessorCheckpoint<'a> {
    pub processing: &'a ProcessingHandle,
    pub info: ProcessorInfo,
}

/// What one commit cycle produced.
#[derive(Debug)]
pub(crate) struct CycleOutcome {
    /// `None` when there was nothing to write.
    pub sequence: Option<u64>,
    /// Per-participant infos, in participant order.
    pub infos: Vec<SliceInfos>,
}

/// Orchestrates dispatch for one named store.
pub struct StateManager {
    name: String,
    connection: Arc<EventLogConnection>,
    store: StoreHandle,
    reducer: RootReducer,
    publisher: Option<Arc<dyn EventBus<OutboundEvent>>>,
}

impl core::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateManager")
            .field("name", &self.name)
            .field("reducer", &self.reducer)
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// `store` must carry the manager's name: it is the key under which the
    /// manager's changes appear in every record.
    pub fn new(
        name: impl Into<String>,
        connection: Arc<EventLogConnection>,
        store: StoreHandle,
        reducer: RootReducer,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        if RESERVED_RECORD_KEYS.contains(&name.as_str()) {
            return Err(DispatchError::ReservedName(name));
        }
        if store.name() != name {
            return Err(DispatchError::StoreMismatch {
                manager: name,
                store: store.name().to_string(),
            });
        }
        Ok(Self {
            name,
            connection,
            store,
            reducer,
            publisher: None,
        })
    }

    /// Publish every committed change set to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventBus<OutboundEvent>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<EventLogConnection> {
        &self.connection
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub async fn dispatch(&self, action: &Action) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_linked(action, None).await
    }

    /// Dispatch `action` here and, in the same record, `linked.1` to `linked.0`.
    pub async fn dispatch_linked(
        &self,
        action: &Action,
        linked: Option<(&StateManager, &Action)>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut participants = vec![Participant { manager: self, action }];
        if let Some((manager, action)) = linked {
            participants.push(Participant { manager, action });
        }

        let out = commit_cycle(&self.connection, &participants, None).await?;
        let mut infos = out.infos.into_iter();
        Ok(DispatchOutcome {
            sequence: out.sequence.unwrap_or_default(),
            info: infos.next().unwrap_or_default(),
            linked_info: infos.next(),
        })
    }

    pub async fn get_value(&self, slice: &str, path: &str, idx: Option<u64>) -> StateResult<Option<serde_json::Value>> {
        self.store.get_value(slice, path, idx).await
    }

    /// Run `f` against the current materialized state.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let store = self.store.read().await;
        f(store.state())
    }

    fn publish(&self, sequence: u64, statechanges: BTreeMap<String, StateChanges>) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let event = OutboundEvent::Events {
            tenant: self.connection.tenant(),
            sequence,
            statechanges,
        };
        if let Err(err) = publisher.publish(event) {
            warn!(manager = %self.name, sequence, error = %err, "failed to publish committed changes");
        }
    }
}

/// One serialized write: reduce, stage, append, commit.
///
/// Shared by [`StateManager::dispatch_linked`] and the workflow processor.
pub(crate) async fn commit_cycle(
    connection: &Arc<EventLogConnection>,
    participants: &[Participant<'_>],
    checkpoint: Option<ProcessorCheckpoint<'_>>,
) -> Result<CycleOutcome, DispatchError> {
    for (i, p) in participants.iter().enumerate() {
        if !Arc::ptr_eq(&p.manager.connection, connection) {
            return Err(DispatchError::ForeignConnection(p.manager.name.clone()));
        }
        if participants[..i].iter().any(|q| q.manager.name == p.manager.name) {
            return Err(DispatchError::DuplicateManager(p.manager.name.clone()));
        }
    }

    let mut lock = connection.acquire().await;
    let sequence = lock.next_sequence();

    // Write guards are taken under the connection mutex only.
    let mut guards = Vec::with_capacity(participants.len());
    for p in participants {
        guards.push(p.manager.store.write().await);
    }

    let mut staged = Vec::with_capacity(participants.len());
    let mut reducer_infos = Vec::with_capacity(participants.len());
    let mut record = EventRecord::new(connection.tenant(), sequence);
    for (p, guard) in participants.iter().zip(guards.iter()) {
        let store: &StateStore = guard;
        let reduction = p.manager.reducer.reduce(store.state(), p.action);
        staged.push(store.stage(sequence, &reduction.changes)?);
        record = record.with_changes(p.manager.name.clone(), reduction.changes);
        reducer_infos.push(reduction.infos);
    }
    if let Some(cp) = &checkpoint {
        record = record.with_processor(cp.processing.name(), cp.info.clone());
    }

    if record.is_empty() {
        debug!(sequence = lock.sequence(), "nothing to commit");
        return Ok(CycleOutcome {
            sequence: None,
            infos: reducer_infos,
        });
    }

    connection.log().append(&record).await?;
    // The record is durable from here on; the position must follow it.
    lock.advance(sequence);

    let mut infos = Vec::with_capacity(participants.len());
    let mut materialize_error = None;
    for ((p, guard), (batch, mut reducer_info)) in participants
        .iter()
        .zip(guards.iter_mut())
        .zip(staged.into_iter().zip(reducer_infos))
    {
        match guard.commit(batch).await {
            Ok(applied) => absorb_apply(&mut reducer_info, &applied),
            Err(source) => {
                warn!(store = %p.manager.name, sequence, error = %source, "store commit failed after append");
                materialize_error.get_or_insert(DispatchError::Materialize {
                    sequence,
                    store: p.manager.name.clone(),
                    source,
                });
            }
        }
        infos.push(reducer_info);
    }

    if let Some(cp) = checkpoint {
        cp.processing.commit(sequence, cp.info).await;
    }

    drop(guards);
    drop(lock);

    info!(
        tenant = %connection.tenant(),
        sequence,
        managers = participants.len(),
        "record committed"
    );

    if let Some(err) = materialize_error {
        return Err(err);
    }

    if let Some(first) = participants.first() {
        first.manager.publish(sequence, record.state);
    }

    Ok(CycleOutcome {
        sequence: Some(sequence),
        infos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{AttachOptions, EventLog, InMemoryEventLog};
    use proptest::prelude::*;
    use serde_json::json;
    use stockflow_core::{PathSchema, SchemaDefinition, SliceState, StateUpdate, TenantId};
    use stockflow_events::{InMemoryEventBus, Reducer, Reduction, combine_reducers};

    fn schema() -> Arc<SchemaDefinition> {
        Arc::new(
            SchemaDefinition::builder()
                .path("things", "items", PathSchema::list_with_identifier("S_", 5))
                .path("things", "hits", PathSchema::counter())
                .path("things", "meta", PathSchema::hash())
                .build()
                .unwrap(),
        )
    }

    fn things_reducer() -> Arc<dyn Reducer> {
        Arc::new(|_: &SliceState, action: &Action| match action.action_type() {
            "NEW" => Reduction::update(StateUpdate::add("items", action.doc().cloned().unwrap_or_default())),
            "HIT" => Reduction::update(StateUpdate::inc("hits")),
            "BOGUS" => Reduction::update(StateUpdate::update("meta", json!({"$set": {"foo": 1}, "bogus": 2}))),
            _ => Reduction::none(),
        })
    }

    async fn connection(log: Arc<InMemoryEventLog>) -> Arc<EventLogConnection> {
        Arc::new(EventLogConnection::attach(log, AttachOptions::default()).await.unwrap())
    }

    fn manager(name: &str, connection: Arc<EventLogConnection>) -> StateManager {
        let store = StoreHandle::new(StateStore::in_memory(name, schema()));
        let reducer = combine_reducers(vec![("things".into(), things_reducer())], vec![]).unwrap();
        StateManager::new(name, connection, store, reducer).unwrap()
    }

    #[tokio::test]
    async fn new_items_get_sequential_identifiers() {
        let tenant = TenantId::new();
        let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
        let sm = manager("main", connection(log.clone()).await);
        let new = Action::new("NEW").with_doc(json!({"name": "test"}));

        let first = sm.dispatch(&new).await.unwrap();
        let added = first.info["things"].added.clone().unwrap();
        assert_eq!(added["id"], json!(0));
        assert_eq!(added["identifier"], json!("S_00000"));

        let second = sm.dispatch(&new).await.unwrap();
        let added = second.info["things"].added.clone().unwrap();
        assert_eq!(added["id"], json!(1));
        assert_eq!(added["identifier"], json!("S_00001"));

        assert_eq!(second.sequence, 2);
        assert_eq!(sm.get_value("_control", "change_count", None).await.unwrap(), Some(json!(2)));
        assert_eq!(sm.get_value("_control", "log_sequence", None).await.unwrap(), Some(json!(2)));
        assert_eq!(log.latest_sequence(tenant).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn schema_violation_leaves_no_record() {
        let tenant = TenantId::new();
        let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
        let sm = manager("main", connection(log.clone()).await);

        let err = sm.dispatch(&Action::new("BOGUS")).await.unwrap_err();
        assert!(matches!(err, DispatchError::State(StateError::InvalidDocument { .. })));

        assert_eq!(log.latest_sequence(tenant).await.unwrap(), 0);
        assert_eq!(sm.connection().sequence().await, 0);
        assert_eq!(sm.get_value("things", "meta", None).await.unwrap(), Some(json!({})));
        assert_eq!(sm.get_value("_control", "change_count", None).await.unwrap(), Some(json!(0)));

        // The connection is still usable.
        assert_eq!(sm.dispatch(&Action::new("HIT")).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn linked_dispatch_writes_one_record() {
        let tenant = TenantId::new();
        let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
        let conn = connection(log.clone()).await;
        let a = manager("a", Arc::clone(&conn));
        let b = manager("b", conn);

        let out = a
            .dispatch_linked(&Action::new("HIT"), Some((&b, &Action::new("NEW").with_doc(json!({})))))
            .await
            .unwrap();
        assert_eq!(out.sequence, 1);
        assert_eq!(out.info["things"].inc, Some(1));
        assert!(out.linked_info.unwrap()["things"].added.is_some());

        let records = log.load_after(tenant, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].changes_for("a").is_some());
        assert!(records[0].changes_for("b").is_some());
    }

    #[tokio::test]
    async fn linked_managers_must_share_the_connection() {
        let log = Arc::new(InMemoryEventLog::with_tenant(TenantId::new()));
        let a = manager("a", connection(log.clone()).await);
        let b = manager("b", connection(log).await);

        let err = a.dispatch_linked(&Action::new("HIT"), Some((&b, &Action::new("HIT")))).await;
        assert!(matches!(err, Err(DispatchError::ForeignConnection(name)) if name == "b"));
    }

    #[tokio::test]
    async fn reserved_names_are_rejected() {
        let log = Arc::new(InMemoryEventLog::with_tenant(TenantId::new()));
        let conn = connection(log).await;
        let store = StoreHandle::new(StateStore::in_memory("processor", schema()));
        let reducer = combine_reducers(vec![], vec![]).unwrap();
        assert!(matches!(
            StateManager::new("processor", conn, store, reducer),
            Err(DispatchError::ReservedName(_))
        ));
    }

    #[tokio::test]
    async fn replay_rebuilds_identical_state() {
        let tenant = TenantId::new();
        let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
        let live = manager("main", connection(log.clone()).await);
        for action in [
            Action::new("NEW").with_doc(json!({"name": "a"})),
            Action::new("HIT"),
            Action::new("NEW").with_doc(json!({"name": "b"})),
            Action::new("NOTHING"),
        ] {
            live.dispatch(&action).await.unwrap();
        }

        let replica = StoreHandle::new(StateStore::in_memory("main", schema()));
        let conn = connection(log).await;
        assert_eq!(conn.roll_forward_state(&[&replica], |_| {}).await.unwrap(), 4);

        let expected = live.read(|s| s.clone()).await;
        assert_eq!(replica.read().await.state(), &expected);
    }

    #[tokio::test]
    async fn committed_changes_are_published() {
        let log = Arc::new(InMemoryEventLog::with_tenant(TenantId::new()));
        let bus = Arc::new(InMemoryEventBus::<OutboundEvent>::new());
        let sub = bus.subscribe();
        let sm = manager("main", connection(log).await).with_publisher(bus);

        sm.dispatch(&Action::new("HIT")).await.unwrap();
        match sub.try_recv().unwrap() {
            OutboundEvent::Events { sequence, statechanges, .. } => {
                assert_eq!(sequence, 1);
                assert!(statechanges.contains_key("main"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn concurrent_dispatches_get_gapless_sequences(n in 1usize..24) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let tenant = TenantId::new();
                let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
                let start = 3;
                for seq in 1..=start {
                    log.append(&EventRecord::new(tenant, seq)).await.unwrap();
                }
                let conn = connection(log.clone()).await;
                conn.roll_forward_state(&[], |_| {}).await.unwrap();
                let sm = Arc::new(manager("main", conn));

                let tasks: Vec<_> = (0..n)
                    .map(|_| {
                        let sm = Arc::clone(&sm);
                        tokio::spawn(async move { sm.dispatch(&Action::new("HIT")).await.unwrap().sequence })
                    })
                    .collect();
                let mut seen = Vec::new();
                for task in tasks {
                    seen.push(task.await.unwrap());
                }
                seen.sort_unstable();

                let expected: Vec<u64> = (start + 1..=start + n as u64).collect();
                assert_eq!(seen, expected);
                assert_eq!(
                    sm.get_value("things", "hits", None).await.unwrap(),
                    Some(json!(n as i64))
                );
            });
        }
    }
}
