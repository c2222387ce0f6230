//! Step context: immutable shared defaults plus request-scoped fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use stockflow_core::TenantId;
use stockflow_events::SliceInfos;

use crate::event_log::EventLogConnection;
use crate::state_manager::StateManager;

/// Everything every workflow run can see.
#[derive(Debug)]
pub struct SharedContext {
    connection: Arc<EventLogConnection>,
    managers: BTreeMap<String, Arc<StateManager>>,
    defaults: Map<String, JsonValue>,
}

impl SharedContext {
    pub fn new(connection: Arc<EventLogConnection>) -> Self {
        Self {
            connection,
            managers: BTreeMap::new(),
            defaults: Map::new(),
        }
    }

    /// Make `manager` reachable from steps under its own name.
    pub fn with_manager(mut self, manager: Arc<StateManager>) -> Self {
        self.managers.insert(manager.name().to_string(), manager);
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn tenant(&self) -> TenantId {
        self.connection.tenant()
    }

    pub fn connection(&self) -> &Arc<EventLogConnection> {
        &self.connection
    }

    pub fn manager(&self, name: &str) -> Option<&Arc<StateManager>> {
        self.managers.get(name)
    }

    pub fn default_field(&self, key: &str) -> Option<&JsonValue> {
        self.defaults.get(key)
    }
}

/// Context of one workflow run for one triggering document.
///
/// Fields set by a step are visible to later steps of the same run only; a
/// resumed run starts with none.
#[derive(Debug)]
pub struct StepContext {
    shared: Arc<SharedContext>,
    doc_id: String,
    trigger: JsonValue,
    function_index: usize,
    fields: Map<String, JsonValue>,
    last_info: Option<SliceInfos>,
}

impl StepContext {
    pub fn new(shared: Arc<SharedContext>, doc_id: impl Into<String>, trigger: JsonValue) -> Self {
        Self {
            shared,
            doc_id: doc_id.into(),
            trigger,
            function_index: 0,
            fields: Map::new(),
            last_info: None,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The full trigger document.
    pub fn trigger(&self) -> &JsonValue {
        &self.trigger
    }

    pub fn function_index(&self) -> usize {
        self.function_index
    }

    pub(crate) fn set_function_index(&mut self, index: usize) {
        self.function_index = index;
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub fn tenant(&self) -> TenantId {
        self.shared.tenant()
    }

    pub fn manager(&self, name: &str) -> Option<&Arc<StateManager>> {
        self.shared.manager(name)
    }

    /// Request field, falling back to the shared default.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key).or_else(|| self.shared.default_field(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.fields.insert(key.into(), value);
    }

    /// Reducer outcome of the action committed at the previous step boundary.
    pub fn last_info(&self) -> Option<&SliceInfos> {
        self.last_info.as_ref()
    }

    pub(crate) fn set_last_info(&mut self, info: Option<SliceInfos>) {
        self.last_info = info;
    }
}
