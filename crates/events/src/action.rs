use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Type of [`Action::checkpoint`]. No business reducer handles it.
pub const CHECKPOINT: &str = "_CHECKPOINT";

/// An action dispatched to a state manager (intent, not fact).
///
/// Actions are transient: reducers turn them into [`StateUpdate`]s, and only
/// those updates are persisted in the event log.
///
/// The wire shape is a flat JSON object with a `type` discriminator, e.g.
/// `{"type": "NEW", "doc": {"name": "test"}}`.
///
/// [`StateUpdate`]: stockflow_core::StateUpdate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(flatten)]
    payload: Map<String, JsonValue>,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: Map::new(),
        }
    }

    /// Carrier for a record that only checkpoints a workflow; reducers leave
    /// every business slice alone, so only `_control` changes.
    pub fn checkpoint() -> Self {
        Self::new(CHECKPOINT)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Shorthand for `with("doc", doc)`.
    pub fn with_doc(self, doc: JsonValue) -> Self {
        self.with("doc", doc)
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn is(&self, action_type: &str) -> bool {
        self.action_type == action_type
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.payload.get(key)
    }

    pub fn doc(&self) -> Option<&JsonValue> {
        self.payload.get("doc")
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(JsonValue::as_str)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(JsonValue::as_u64)
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(JsonValue::as_i64)
    }

    pub fn payload(&self) -> &Map<String, JsonValue> {
        &self.payload
    }
}
