//! Materialized value space.
//!
//! Reducers read these types; only the state store's apply engine builds new
//! versions of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::schema::{PathSchema, SchemaDefinition, SliceSchema, ValueKind};

/// Ordered LIST of documents with a monotonically advancing id allocator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListValue {
    next_id: u64,
    items: BTreeMap<u64, JsonValue>,
}

impl ListValue {
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn get(&self, id: u64) -> Option<&JsonValue> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &JsonValue)> {
        self.items.iter().map(|(id, doc)| (*id, doc))
    }

    /// First item whose `field` equals `value`.
    pub fn find_by(&self, field: &str, value: &JsonValue) -> Option<(u64, &JsonValue)> {
        self.iter().find(|(_, doc)| doc.get(field) == Some(value))
    }

    /// Reserve the next id. Ids are never reused, even after RM.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: u64, doc: JsonValue) {
        self.items.insert(id, doc);
    }

    pub fn remove(&mut self, id: u64) -> Option<JsonValue> {
        self.items.remove(&id)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.items.values().cloned().collect())
    }
}

/// Value stored at one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum PathValue {
    Hash(Map<String, JsonValue>),
    List(ListValue),
    Counter(i64),
}

impl PathValue {
    /// Default value for a declaration: declared initial hash, empty list, or zero.
    pub fn initial(decl: &PathSchema) -> Self {
        match decl.kind {
            ValueKind::Hash => PathValue::Hash(decl.values.clone().unwrap_or_default()),
            ValueKind::List => PathValue::List(ListValue::default()),
            ValueKind::Counter => PathValue::Counter(0),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            PathValue::Hash(_) => ValueKind::Hash,
            PathValue::List(_) => ValueKind::List,
            PathValue::Counter(_) => ValueKind::Counter,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            PathValue::Hash(map) => JsonValue::Object(map.clone()),
            PathValue::List(list) => list.to_json(),
            PathValue::Counter(n) => JsonValue::from(*n),
        }
    }
}

/// All paths of one slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceState {
    paths: BTreeMap<String, PathValue>,
}

impl SliceState {
    pub fn initial(decl: &SliceSchema) -> Self {
        Self {
            paths: decl
                .iter()
                .map(|(path, d)| (path.clone(), PathValue::initial(d)))
                .collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&PathValue> {
        self.paths.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut PathValue> {
        self.paths.get_mut(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, value: PathValue) {
        self.paths.insert(path.into(), value);
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, &PathValue)> {
        self.paths.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn list(&self, path: &str) -> Option<&ListValue> {
        match self.paths.get(path)? {
            PathValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn item(&self, path: &str, id: u64) -> Option<&JsonValue> {
        self.list(path)?.get(id)
    }

    pub fn hash(&self, path: &str) -> Option<&Map<String, JsonValue>> {
        match self.paths.get(path)? {
            PathValue::Hash(map) => Some(map),
            _ => None,
        }
    }

    pub fn counter(&self, path: &str) -> Option<i64> {
        match self.paths.get(path)? {
            PathValue::Counter(n) => Some(*n),
            _ => None,
        }
    }
}

/// Every slice of one store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreState {
    slices: BTreeMap<String, SliceState>,
}

impl StoreState {
    /// Type-appropriate defaults for every declared path.
    pub fn initial(schema: &SchemaDefinition) -> Self {
        Self {
            slices: schema
                .slices()
                .map(|(name, decl)| (name.to_string(), SliceState::initial(decl)))
                .collect(),
        }
    }

    pub fn slice(&self, slice: &str) -> Option<&SliceState> {
        self.slices.get(slice)
    }

    pub fn slice_mut(&mut self, slice: &str) -> Option<&mut SliceState> {
        self.slices.get_mut(slice)
    }

    pub fn slices(&self) -> impl Iterator<Item = (&str, &SliceState)> {
        self.slices.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert_slice(&mut self, slice: impl Into<String>, state: SliceState) {
        self.slices.insert(slice.into(), state);
    }

    pub fn path(&self, slice: &str, path: &str) -> Option<&PathValue> {
        self.slices.get(slice)?.get(path)
    }

    pub fn set_path(&mut self, slice: &str, path: &str, value: PathValue) {
        self.slices
            .entry(slice.to_string())
            .or_default()
            .insert(path, value);
    }

    /// Fill in any declared path missing from `self` (e.g. after a schema gained a path).
    pub fn fill_missing(&mut self, schema: &SchemaDefinition) {
        for (slice, decl) in schema.slices() {
            let state = self.slices.entry(slice.to_string()).or_default();
            for (path, d) in decl {
                if state.get(path).is_none() {
                    state.insert(path.clone(), PathValue::initial(d));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PathSchema, SchemaDefinition, CONTROL_SLICE, LOG_SEQUENCE};
    use serde_json::json;

    fn schema() -> SchemaDefinition {
        let mut values = Map::new();
        values.insert("open".into(), json!(true));
        SchemaDefinition::builder()
            .path("shop", "items", PathSchema::list())
            .path("shop", "settings", PathSchema::hash_with(values))
            .path("shop", "visits", PathSchema::counter())
            .build()
            .unwrap()
    }

    #[test]
    fn initial_state_uses_type_defaults() {
        let state = StoreState::initial(&schema());
        let shop = state.slice("shop").unwrap();

        assert!(shop.list("items").unwrap().is_empty());
        assert_eq!(shop.list("items").unwrap().next_id(), 0);
        assert_eq!(shop.hash("settings").unwrap()["open"], json!(true));
        assert_eq!(shop.counter("visits"), Some(0));
        assert_eq!(
            state.slice(CONTROL_SLICE).unwrap().counter(LOG_SEQUENCE),
            Some(0)
        );
    }

    #[test]
    fn allocate_never_reuses_ids() {
        let mut list = ListValue::default();
        let a = list.allocate();
        list.insert(a, json!({"id": a}));
        list.remove(a);
        let b = list.allocate();
        assert_eq!((a, b), (0, 1));
    }

    #[test]
    fn path_value_serializes_with_kind_tag() {
        let value = serde_json::to_value(PathValue::Counter(3)).unwrap();
        assert_eq!(value, json!({"type": "COUNTER", "value": 3}));
    }

    #[test]
    fn fill_missing_adds_new_paths_only() {
        let mut state = StoreState::default();
        state.set_path("shop", "visits", PathValue::Counter(9));
        state.fill_missing(&schema());
        assert_eq!(state.slice("shop").unwrap().counter("visits"), Some(9));
        assert!(state.slice("shop").unwrap().list("items").is_some());
    }

    mod proptest_tests {
        use super::*;
        use crate::schema::IdentifierFormat;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// Allocated ids strictly increase whatever mix of adds and removes came before.
            #[test]
            fn allocated_ids_strictly_increase(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
                let mut list = ListValue::default();
                let mut last: Option<u64> = None;
                for add in ops {
                    if add {
                        let id = list.allocate();
                        if let Some(prev) = last {
                            prop_assert!(id > prev);
                        }
                        list.insert(id, json!({"id": id}));
                        last = Some(id);
                    } else {
                        let first = list.iter().next().map(|(id, _)| id);
                        if let Some(id) = first {
                            list.remove(id);
                        }
                    }
                }
                prop_assert_eq!(list.next_id(), last.map_or(0, |l| l + 1));
            }

            #[test]
            fn identifier_keeps_prefix_and_pads_to_width(
                prefix in "[A-Z]{1,4}_",
                width in 0usize..8,
                id in 0u64..1_000_000,
            ) {
                let formatted = IdentifierFormat::new(prefix.clone(), width).format(id);
                let digits = &formatted[prefix.len()..];
                prop_assert!(formatted.starts_with(&prefix));
                prop_assert!(digits.len() >= width);
                prop_assert_eq!(digits.parse::<u64>().unwrap(), id);
            }
        }
    }
}
