//! Typed apply engine.
//!
//! [`stage`] validates a whole batch of updates against the schema and
//! computes the new value of every touched path in an overlay. Nothing is
//! visible until the caller commits the returned [`StagedBatch`], so a
//! rejected update leaves the store exactly as it was.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use stockflow_core::{
    CONTROL_SLICE, LOG_SEQUENCE, ListValue, Method, PathSchema, PathValue, SchemaDefinition, StateChanges,
    StateError, StateResult, StateUpdate, StoreState,
};
use stockflow_events::ApplyInfo;

const MERGE: &str = "$merge";
const SET: &str = "$set";

/// Final value of one path touched by a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PathWrite {
    pub slice: String,
    pub path: String,
    pub value: PathValue,
}

/// A validated batch, ready to be written and swapped in.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub sequence: u64,
    pub writes: Vec<PathWrite>,
    pub info: BTreeMap<String, ApplyInfo>,
}

impl StagedBatch {
    /// Install every write into `state`.
    pub fn apply_to(&self, state: &mut StoreState) {
        for write in &self.writes {
            state.set_path(&write.slice, &write.path, write.value.clone());
        }
    }
}

/// Validate `changes` against `current` without modifying it.
///
/// Only touched paths are copied. Also records `sequence` as the store's
/// `_control.log_sequence`.
pub fn stage(
    schema: &SchemaDefinition,
    current: &StoreState,
    sequence: u64,
    changes: &StateChanges,
) -> StateResult<StagedBatch> {
    let mut overlay: BTreeMap<(String, String), PathValue> = BTreeMap::new();
    let mut info: BTreeMap<String, ApplyInfo> = BTreeMap::new();

    for (slice, updates) in changes.iter() {
        let slice_info = info.entry(slice.to_string()).or_default();
        for update in updates {
            let decl = schema.path(slice, &update.path)?;
            let value = overlay
                .entry((slice.to_string(), update.path.clone()))
                .or_insert_with(|| {
                    current
                        .path(slice, &update.path)
                        .cloned()
                        .unwrap_or_else(|| PathValue::initial(decl))
                });

            apply_update(slice, decl, value, update, slice_info)?;
        }
    }

    overlay.insert(
        (CONTROL_SLICE.to_string(), LOG_SEQUENCE.to_string()),
        PathValue::Counter(sequence as i64),
    );

    let writes = overlay
        .into_iter()
        .map(|((slice, path), value)| PathWrite { slice, path, value })
        .collect();

    Ok(StagedBatch { sequence, writes, info })
}

fn apply_update(
    slice: &str,
    decl: &PathSchema,
    value: &mut PathValue,
    update: &StateUpdate,
    info: &mut ApplyInfo,
) -> StateResult<()> {
    let not_allowed = || StateError::MethodNotAllowed {
        method: update.method,
        kind: decl.kind,
        slice: slice.to_string(),
        path: update.path.clone(),
    };

    match (update.method, value) {
        (Method::Set, PathValue::Hash(map)) => {
            if update.filter.is_some() {
                return Err(StateError::invalid_document(slice, &update.path, "filter is not allowed on a HASH"));
            }
            *map = object_doc(slice, update)?.clone();
        }
        (Method::Set, PathValue::List(list)) => {
            let id = filter_id(slice, update)?;
            let existing = require_item(slice, update, list, id)?;
            let mut doc = object_doc(slice, update)?.clone();
            doc.insert("id".to_string(), JsonValue::from(id));
            if !doc.contains_key("identifier") {
                if let Some(identifier) = existing.get("identifier") {
                    doc.insert("identifier".to_string(), identifier.clone());
                }
            }
            list.insert(id, JsonValue::Object(doc));
        }
        (Method::Add, PathValue::List(list)) => {
            let mut doc = object_doc(slice, update)?.clone();
            if doc.contains_key("id") {
                return Err(StateError::CallerSuppliedId {
                    slice: slice.to_string(),
                    path: update.path.clone(),
                });
            }
            let id = list.allocate();
            doc.insert("id".to_string(), JsonValue::from(id));
            if let Some(format) = &decl.identifier_format {
                doc.insert("identifier".to_string(), JsonValue::from(format.format(id)));
            }
            let doc = JsonValue::Object(doc);
            list.insert(id, doc.clone());
            info.added = Some(doc);
        }
        (Method::Rm, PathValue::List(list)) => {
            let id = filter_id(slice, update)?;
            if list.remove(id).is_none() {
                return Err(missing(slice, update, Some(id)));
            }
        }
        (Method::Update, PathValue::List(list)) => {
            let id = filter_id(slice, update)?;
            let existing = require_item(slice, update, list, id)?;
            let Some(mut target) = existing.as_object().cloned() else {
                return Err(StateError::invalid_document(slice, &update.path, "stored item is not an object"));
            };
            merge_operators(slice, update, &mut target)?;
            target.insert("id".to_string(), JsonValue::from(id));
            let merged = JsonValue::Object(target);
            list.insert(id, merged.clone());
            info.merged = Some(merged);
        }
        (Method::Update, PathValue::Hash(map)) => {
            if update.filter.is_some() {
                return Err(StateError::invalid_document(slice, &update.path, "filter is not allowed on a HASH"));
            }
            merge_operators(slice, update, map)?;
            info.merged = Some(JsonValue::Object(map.clone()));
        }
        (Method::Inc, PathValue::Counter(n)) => {
            *n += 1;
            info.inc = Some(*n);
        }
        (_, stored) if stored.kind() != decl.kind => {
            return Err(StateError::InvalidDocument {
                slice: slice.to_string(),
                path: update.path.clone(),
                reason: format!("stored value is {} but declared {}", stored.kind(), decl.kind),
            });
        }
        _ => return Err(not_allowed()),
    }

    Ok(())
}

fn filter_id(slice: &str, update: &StateUpdate) -> StateResult<u64> {
    update.filter.map(|f| f.id).ok_or_else(|| StateError::MissingFilter {
        method: update.method,
        slice: slice.to_string(),
        path: update.path.clone(),
    })
}

fn missing(slice: &str, update: &StateUpdate, id: Option<u64>) -> StateError {
    StateError::MissingDocument {
        slice: slice.to_string(),
        path: update.path.clone(),
        id,
    }
}

fn require_item<'a>(slice: &str, update: &StateUpdate, list: &'a ListValue, id: u64) -> StateResult<&'a JsonValue> {
    list.get(id).ok_or_else(|| missing(slice, update, Some(id)))
}

fn object_doc<'a>(slice: &str, update: &'a StateUpdate) -> StateResult<&'a Map<String, JsonValue>> {
    match &update.doc {
        Some(JsonValue::Object(map)) => Ok(map),
        Some(_) => Err(StateError::invalid_document(slice, &update.path, "doc must be an object")),
        None => Err(StateError::invalid_document(slice, &update.path, "doc is required")),
    }
}

/// Apply `$merge` (one level deep) then `$set` (overwrite) to `target`.
///
/// Any other top-level key rejects the whole update.
fn merge_operators(slice: &str, update: &StateUpdate, target: &mut Map<String, JsonValue>) -> StateResult<()> {
    let doc = object_doc(slice, update)?;

    if let Some(key) = doc.keys().find(|k| k.as_str() != MERGE && k.as_str() != SET) {
        return Err(StateError::invalid_document(
            slice,
            &update.path,
            format!("unsupported UPDATE key '{key}'"),
        ));
    }

    let operand = |op: &str| -> StateResult<Option<&Map<String, JsonValue>>> {
        match doc.get(op) {
            None => Ok(None),
            Some(JsonValue::Object(map)) => Ok(Some(map)),
            Some(_) => Err(StateError::invalid_document(
                slice,
                &update.path,
                format!("{op} must be an object"),
            )),
        }
    };
    let merge = operand(MERGE)?;
    let set = operand(SET)?;

    if let Some(merge) = merge {
        for (key, incoming) in merge {
            match (target.get_mut(key), incoming) {
                (Some(JsonValue::Object(existing)), JsonValue::Object(fields)) => {
                    for (k, v) in fields {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    target.insert(key.clone(), incoming.clone());
                }
            }
        }
    }

    if let Some(set) = set {
        for (key, value) in set {
            target.insert(key.clone(), value.clone());
        }
    }

    Ok(())
}

/// Whole path value, or one LIST item when `idx` is given.
pub(crate) fn read_value(
    state: &StoreState,
    schema: &SchemaDefinition,
    slice: &str,
    path: &str,
    idx: Option<u64>,
) -> StateResult<Option<JsonValue>> {
    let decl = schema.path(slice, path)?;
    let value = state
        .path(slice, path)
        .cloned()
        .unwrap_or_else(|| PathValue::initial(decl));

    match (idx, value) {
        (None, value) => Ok(Some(value.to_json())),
        (Some(id), PathValue::List(list)) => Ok(list.get(id).cloned()),
        (Some(_), other) => Err(StateError::invalid_document(
            slice,
            path,
            format!("index lookup on a {} path", other.kind()),
        )),
    }
}
