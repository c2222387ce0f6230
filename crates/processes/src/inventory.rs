//! Inventory slice: stock on hand and reservations per SKU.
//!
//! Business-rule failures (unknown SKU, shortfall) are reported through
//! `ReducerInfo.failed` and recorded in `last_failure`, so the attempt still
//! lands in the log.
//!
//! Allocation and shipping are driven by the orders pass-in reducer, which
//! hands this reducer `RESERVE_STOCK` and `SHIP_STOCK`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use stockflow_core::{SliceState, StateUpdate};
use stockflow_events::{Action, Reduction};

use crate::actions::{self, qty};
use crate::schema::{failure, find_item, hash_i64};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sku: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub on_hand: i64,
    #[serde(default)]
    pub reserved: i64,
}

impl InventoryItem {
    /// Stock not yet promised to anyone.
    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }
}

/// Look up an item by SKU.
pub fn item(state: &SliceState, sku: &str) -> Option<(u64, InventoryItem)> {
    find_item(state, "items", "sku", sku)
}

pub fn inventory_reducer(state: &SliceState, action: &Action) -> Reduction {
    match action.action_type() {
        actions::NEW_ITEM => new_item(state, action),
        actions::RECEIVE_STOCK => receive(state, action, false),
        actions::INVENTORY_COMPLETE => receive(state, action, true),
        actions::RESERVE_STOCK => reserve(state, action),
        actions::SHIP_STOCK => ship(state, action),
        _ => Reduction::none(),
    }
}

fn new_item(state: &SliceState, action: &Action) -> Reduction {
    let Some(sku) = action.str("sku") else {
        return failure(action, "NEW_ITEM requires a sku", vec![]);
    };
    if item(state, sku).is_some() {
        return failure(action, format!("item {sku} already exists"), vec![]);
    }
    let name = action.str("name").unwrap_or(sku);
    Reduction::update(StateUpdate::add(
        "items",
        json!({"sku": sku, "name": name, "on_hand": 0, "reserved": 0}),
    ))
}

/// Add stock. Built stock for an unknown SKU creates the item.
fn receive(state: &SliceState, action: &Action, built: bool) -> Reduction {
    let (Some(sku), Some(qty)) = (action.str("sku"), qty(action)) else {
        return failure(action, format!("{} requires a sku and a positive qty", action.action_type()), vec![]);
    };

    let received = hash_i64(state, "totals", "received") + qty;
    let totals = StateUpdate::update("totals", json!({"$set": {"received": received}}));

    match item(state, sku) {
        Some((id, current)) => Reduction::updates(vec![
            StateUpdate::update_item("items", id, json!({"$set": {"on_hand": current.on_hand + qty}})),
            totals,
        ]),
        None if built => Reduction::updates(vec![
            StateUpdate::add("items", json!({"sku": sku, "name": sku, "on_hand": qty, "reserved": 0})),
            totals,
        ]),
        None => failure(action, format!("unknown sku {sku}"), vec![]),
    }
}

fn reserve(state: &SliceState, action: &Action) -> Reduction {
    let (Some(sku), Some(qty)) = (action.str("sku"), qty(action)) else {
        return failure(action, format!("{} requires a sku and a positive qty", action.action_type()), vec![]);
    };
    let Some((id, current)) = item(state, sku) else {
        return failure(action, format!("unknown sku {sku}"), vec![]);
    };

    let available = current.available();
    if available < qty {
        return failure(
            action,
            format!("insufficient stock for {sku}: {available} available, {qty} requested"),
            vec![StateUpdate::update_item(
                "items",
                id,
                json!({"$set": {"shortfall": qty - available}}),
            )],
        );
    }
    Reduction::update(StateUpdate::update_item(
        "items",
        id,
        json!({"$set": {"reserved": current.reserved + qty, "shortfall": 0}}),
    ))
}

fn ship(state: &SliceState, action: &Action) -> Reduction {
    let (Some(sku), Some(qty)) = (action.str("sku"), qty(action)) else {
        return failure(action, "SHIP_STOCK requires a sku and a positive qty", vec![]);
    };
    let Some((id, current)) = item(state, sku) else {
        return failure(action, format!("unknown sku {sku}"), vec![]);
    };
    if current.on_hand < qty {
        return failure(
            action,
            format!("cannot ship {qty} of {sku}: {} on hand", current.on_hand),
            vec![],
        );
    }

    let released = action.i64("reserved").unwrap_or(0).clamp(0, current.reserved.min(qty).max(0));
    let shipped = hash_i64(state, "totals", "shipped") + qty;
    Reduction::updates(vec![
        StateUpdate::update_item(
            "items",
            id,
            json!({"$set": {"on_hand": current.on_hand - qty, "reserved": current.reserved - released}}),
        ),
        StateUpdate::update("totals", json!({"$set": {"shipped": shipped}})),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{INVENTORY, LAST_FAILURE, operations_schema};
    use stockflow_core::{Method, StoreState};

    fn empty() -> SliceState {
        let schema = operations_schema().unwrap();
        StoreState::initial(&schema).slice(INVENTORY).cloned().unwrap()
    }

    fn with_item(on_hand: i64, reserved: i64) -> SliceState {
        let mut state = empty();
        let Some(stockflow_core::PathValue::List(items)) = state.get_mut("items") else {
            panic!("items is a list");
        };
        let id = items.allocate();
        items.insert(
            id,
            json!({"id": id, "sku": "A-1", "name": "Widget", "on_hand": on_hand, "reserved": reserved}),
        );
        state
    }

    #[test]
    fn new_item_adds_once() {
        let r = inventory_reducer(&empty(), &actions::new_item("A-1", "Widget"));
        assert!(!r.info.failed);
        assert_eq!(r.updates.len(), 1);
        assert_eq!(r.updates[0].method, Method::Add);

        let dup = inventory_reducer(&with_item(0, 0), &actions::new_item("A-1", "Widget"));
        assert!(dup.info.failed);
        assert_eq!(dup.updates.len(), 1);
        assert_eq!(dup.updates[0].path, LAST_FAILURE);
        assert_eq!(dup.updates[0].doc.as_ref().unwrap()["$set"]["message"], json!("item A-1 already exists"));
    }

    #[test]
    fn receive_updates_on_hand_and_totals() {
        let r = inventory_reducer(&with_item(3, 0), &actions::receive_stock("A-1", 4));
        assert!(!r.info.failed);
        assert_eq!(r.updates[0].doc, Some(json!({"$set": {"on_hand": 7}})));
        assert_eq!(r.updates[1].doc, Some(json!({"$set": {"received": 4}})));

        let unknown = inventory_reducer(&empty(), &actions::receive_stock("A-1", 4));
        assert!(unknown.info.failed);
    }

    #[test]
    fn shortfall_is_recorded_as_a_failed_update() {
        let r = inventory_reducer(&with_item(5, 3), &actions::reserve_stock("A-1", 4));
        assert!(r.info.failed);
        assert_eq!(r.updates.len(), 2);
        assert_eq!(r.updates[0].doc, Some(json!({"$set": {"shortfall": 2}})));
        assert_eq!(r.updates[1].path, LAST_FAILURE);

        let ok = inventory_reducer(&with_item(5, 3), &actions::reserve_stock("A-1", 2));
        assert!(!ok.info.failed);
        assert_eq!(ok.updates[0].doc, Some(json!({"$set": {"reserved": 5, "shortfall": 0}})));
    }

    #[test]
    fn ship_releases_only_its_own_reservation() {
        let r = inventory_reducer(&with_item(10, 6), &actions::ship_stock("A-1", 4, 0));
        assert_eq!(
            r.updates[0].doc,
            Some(json!({"$set": {"on_hand": 6, "reserved": 6}}))
        );

        let r = inventory_reducer(&with_item(10, 6), &actions::ship_stock("A-1", 4, 4));
        assert_eq!(
            r.updates[0].doc,
            Some(json!({"$set": {"on_hand": 6, "reserved": 2}}))
        );

        let short = inventory_reducer(&with_item(2, 0), &actions::ship_stock("A-1", 4, 0));
        assert!(short.info.failed);
        assert_eq!(short.updates.len(), 1);
        assert_eq!(short.updates[0].path, LAST_FAILURE);
    }

    #[test]
    fn other_actions_are_ignored() {
        assert!(inventory_reducer(&empty(), &actions::set_stage("R-1", "complete")).is_noop());
        assert!(inventory_reducer(&with_item(5, 0), &actions::ship("R-1", "A-1", 1, 0)).is_noop());
        assert!(inventory_reducer(&with_item(5, 0), &actions::allocate("R-1", "A-1", 1)).is_noop());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// A successful SHIP never drives on_hand or reserved below zero.
            #[test]
            fn ship_keeps_counts_non_negative(
                on_hand in 0i64..50,
                reserved in 0i64..50,
                qty in 1i64..60,
                claimed in -10i64..80,
            ) {
                let r = inventory_reducer(&with_item(on_hand, reserved), &actions::ship_stock("A-1", qty, claimed));
                if qty > on_hand {
                    prop_assert!(r.info.failed);
                    prop_assert!(r.updates.iter().all(|u| u.path == LAST_FAILURE));
                } else {
                    let doc = r.updates[0].doc.clone().unwrap();
                    let after_on_hand = doc["$set"]["on_hand"].as_i64().unwrap();
                    let after_reserved = doc["$set"]["reserved"].as_i64().unwrap();
                    prop_assert_eq!(after_on_hand, on_hand - qty);
                    prop_assert!(after_reserved >= 0);
                    prop_assert!(after_reserved <= reserved);
                }
            }
        }
    }
}
