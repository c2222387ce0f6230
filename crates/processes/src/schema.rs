//! Slice layout of the `operations` store.
//!
//! ```text
//! inventory.items      LIST    INV_00000..  {sku, name, on_hand, reserved}
//! inventory.totals     HASH                 {received, shipped}
//! factory.orders       LIST    FO_00000..   {order, sku, qty, stage}
//! factory.completed    COUNTER
//! orders.orders        LIST    ORD_00000..  {request, customer, sku, qty, status}
//! orders.shipped       COUNTER
//! <slice>.last_failure HASH                 {action, subject, message}
//! ```
//!
//! Every slice keeps the most recent business-rule failure it reported, so a
//! refused action still writes to the log.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue, json};

use stockflow_core::{PathSchema, SchemaDefinition, SliceState, StateResult, StateUpdate};
use stockflow_events::{Action, Reduction};

pub const INVENTORY: &str = "inventory";
pub const FACTORY: &str = "factory";
pub const ORDERS: &str = "orders";
pub const LAST_FAILURE: &str = "last_failure";

pub fn operations_schema() -> StateResult<SchemaDefinition> {
    let mut totals = Map::new();
    totals.insert("received".to_string(), JsonValue::from(0));
    totals.insert("shipped".to_string(), JsonValue::from(0));

    SchemaDefinition::builder()
        .path(INVENTORY, "items", PathSchema::list_with_identifier("INV_", 5))
        .path(INVENTORY, "totals", PathSchema::hash_with(totals))
        .path(FACTORY, "orders", PathSchema::list_with_identifier("FO_", 5))
        .path(FACTORY, "completed", PathSchema::counter())
        .path(ORDERS, "orders", PathSchema::list_with_identifier("ORD_", 5))
        .path(ORDERS, "shipped", PathSchema::counter())
        .path(INVENTORY, LAST_FAILURE, PathSchema::hash())
        .path(FACTORY, LAST_FAILURE, PathSchema::hash())
        .path(ORDERS, LAST_FAILURE, PathSchema::hash())
        .build()
}

/// A failed reduction that records `message` in the slice's `last_failure`.
///
/// `extra` updates land before the failure record.
pub(crate) fn failure(action: &Action, message: impl Into<String>, mut extra: Vec<StateUpdate>) -> Reduction {
    let message = message.into();
    let subject = ["request", "order", "sku"].iter().find_map(|key| action.str(key));
    extra.push(StateUpdate::update(
        LAST_FAILURE,
        json!({"$set": {
            "action": action.action_type(),
            "subject": subject,
            "message": message,
        }}),
    ));
    Reduction::failed(message, extra)
}

/// First LIST item at `path` whose `field` equals `value`, decoded as `T`.
///
/// Items that do not decode are treated as absent.
pub(crate) fn find_item<T: DeserializeOwned>(
    state: &SliceState,
    path: &str,
    field: &str,
    value: &str,
) -> Option<(u64, T)> {
    let (id, doc) = state.list(path)?.find_by(field, &JsonValue::from(value))?;
    serde_json::from_value(doc.clone()).ok().map(|item| (id, item))
}

pub(crate) fn hash_i64(state: &SliceState, path: &str, key: &str) -> i64 {
    state
        .hash(path)
        .and_then(|map| map.get(key))
        .and_then(JsonValue::as_i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{StoreState, ValueKind};

    #[test]
    fn schema_declares_every_slice() {
        let schema = operations_schema().unwrap();
        assert_eq!(schema.path(INVENTORY, "items").unwrap().kind, ValueKind::List);
        assert_eq!(schema.path(FACTORY, "completed").unwrap().kind, ValueKind::Counter);
        assert_eq!(schema.path(ORDERS, "shipped").unwrap().kind, ValueKind::Counter);

        let state = StoreState::initial(&schema);
        let inventory = state.slice(INVENTORY).unwrap();
        assert_eq!(hash_i64(inventory, "totals", "received"), 0);
        assert!(inventory.list("items").unwrap().is_empty());
        assert!(inventory.hash(LAST_FAILURE).unwrap().is_empty());
    }

    #[test]
    fn failures_name_the_action_and_its_subject() {
        let r = failure(&crate::actions::reserve_stock("A-1", 3), "short", vec![StateUpdate::inc("x")]);
        assert!(r.info.failed);
        assert_eq!(r.info.message.as_deref(), Some("short"));
        assert_eq!(r.updates.len(), 2);
        assert_eq!(r.updates[1].path, LAST_FAILURE);
        assert_eq!(
            r.updates[1].doc,
            Some(json!({"$set": {"action": "RESERVE_STOCK", "subject": "A-1", "message": "short"}}))
        );
    }
}
