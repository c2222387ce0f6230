//! Declarative state mutations produced by reducers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Mutation method of a [`StateUpdate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Replace a HASH wholesale or one LIST item.
    Set,
    /// Append a new LIST item with an allocated id.
    Add,
    /// Remove a LIST item.
    Rm,
    /// `$merge`/`$set` into a LIST item or a HASH.
    Update,
    /// Increment a COUNTER by one.
    Inc,
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Method::Set => "SET",
            Method::Add => "ADD",
            Method::Rm => "RM",
            Method::Update => "UPDATE",
            Method::Inc => "INC",
        };
        f.write_str(name)
    }
}

/// Locates one LIST document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub id: u64,
}

/// One declarative mutation instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<JsonValue>,
}

impl StateUpdate {
    /// Replace a HASH.
    pub fn set(path: impl Into<String>, doc: JsonValue) -> Self {
        Self {
            method: Method::Set,
            path: path.into(),
            filter: None,
            doc: Some(doc),
        }
    }

    /// Replace the LIST item `id`.
    pub fn set_item(path: impl Into<String>, id: u64, doc: JsonValue) -> Self {
        Self {
            method: Method::Set,
            path: path.into(),
            filter: Some(Filter { id }),
            doc: Some(doc),
        }
    }

    pub fn add(path: impl Into<String>, doc: JsonValue) -> Self {
        Self {
            method: Method::Add,
            path: path.into(),
            filter: None,
            doc: Some(doc),
        }
    }

    pub fn rm(path: impl Into<String>, id: u64) -> Self {
        Self {
            method: Method::Rm,
            path: path.into(),
            filter: Some(Filter { id }),
            doc: None,
        }
    }

    /// UPDATE a HASH (no filter).
    pub fn update(path: impl Into<String>, doc: JsonValue) -> Self {
        Self {
            method: Method::Update,
            path: path.into(),
            filter: None,
            doc: Some(doc),
        }
    }

    /// UPDATE the LIST item `id`.
    pub fn update_item(path: impl Into<String>, id: u64, doc: JsonValue) -> Self {
        Self {
            method: Method::Update,
            path: path.into(),
            filter: Some(Filter { id }),
            doc: Some(doc),
        }
    }

    pub fn inc(path: impl Into<String>) -> Self {
        Self {
            method: Method::Inc,
            path: path.into(),
            filter: None,
            doc: None,
        }
    }
}

/// Updates for a single slice, in the order they must be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceChanges {
    pub slice: String,
    pub updates: Vec<StateUpdate>,
}

/// Ordered mapping slice → updates.
///
/// Persisted as an array so the ordering survives storage engines that
/// reorder object keys (JSONB does).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateChanges(Vec<SliceChanges>);

impl StateChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append updates for `slice`, keeping the slice's first-seen position.
    pub fn extend(&mut self, slice: &str, updates: impl IntoIterator<Item = StateUpdate>) {
        let mut updates = updates.into_iter().peekable();
        if updates.peek().is_none() {
            return;
        }
        match self.0.iter_mut().find(|c| c.slice == slice) {
            Some(existing) => existing.updates.extend(updates),
            None => self.0.push(SliceChanges {
                slice: slice.to_string(),
                updates: updates.collect(),
            }),
        }
    }

    pub fn get(&self, slice: &str) -> Option<&[StateUpdate]> {
        self.0
            .iter()
            .find(|c| c.slice == slice)
            .map(|c| c.updates.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[StateUpdate])> {
        self.0.iter().map(|c| (c.slice.as_str(), c.updates.as_slice()))
    }

    pub fn slices(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.slice.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|c| c.updates.is_empty())
    }

    pub fn update_count(&self) -> usize {
        self.0.iter().map(|c| c.updates.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extend_keeps_first_seen_slice_order() {
        let mut changes = StateChanges::new();
        changes.extend("_control", [StateUpdate::inc("change_count")]);
        changes.extend("orders", [StateUpdate::add("orders", json!({"a": 1}))]);
        changes.extend("_control", [StateUpdate::inc("change_count")]);

        let slices: Vec<_> = changes.slices().collect();
        assert_eq!(slices, vec!["_control", "orders"]);
        assert_eq!(changes.get("_control").unwrap().len(), 2);
        assert_eq!(changes.update_count(), 3);
    }

    #[test]
    fn empty_update_lists_are_not_recorded() {
        let mut changes = StateChanges::new();
        changes.extend("orders", Vec::new());
        assert!(changes.is_empty());
        assert_eq!(changes.slices().count(), 0);
    }

    #[test]
    fn wire_shape_uses_upper_case_methods_and_omits_empty_fields() {
        let update = StateUpdate::update_item("orders", 3, json!({"$set": {"x": 1}}));
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(
            value,
            json!({"method": "UPDATE", "path": "orders", "filter": {"id": 3}, "doc": {"$set": {"x": 1}}})
        );

        let inc = serde_json::to_value(StateUpdate::inc("hits")).unwrap();
        assert_eq!(inc, json!({"method": "INC", "path": "hits"}));
    }

    #[test]
    fn negative_filter_id_fails_to_decode() {
        let raw = json!({"method": "RM", "path": "orders", "filter": {"id": -1}});
        assert!(serde_json::from_value::<StateUpdate>(raw).is_err());
    }
}
