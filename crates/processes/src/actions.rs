//! Action types understood by the operations reducers.

use serde_json::json;

use stockflow_events::Action;

pub const NEW_ITEM: &str = "NEW_ITEM";
pub const RECEIVE_STOCK: &str = "RECEIVE_STOCK";
pub const RESERVE_STOCK: &str = "RESERVE_STOCK";
/// Built stock arriving from the factory. Only produced by the factory pass-in.
pub const INVENTORY_COMPLETE: &str = "INVENTORY_COMPLETE";
/// Stock leaving the warehouse. Only produced by the orders pass-in on `SHIP`.
pub const SHIP_STOCK: &str = "SHIP_STOCK";

pub const NEW_FACTORY_ORDER: &str = "NEW_FACTORY_ORDER";
pub const SET_STAGE: &str = "SET_STAGE";

pub const NEW: &str = "NEW";
pub const ALLOCATE: &str = "ALLOCATE";
pub const SHIP: &str = "SHIP";
pub const REJECT: &str = "REJECT";

pub fn new_item(sku: &str, name: &str) -> Action {
    Action::new(NEW_ITEM)
        .with("sku", json!(sku))
        .with("name", json!(name))
}

pub fn receive_stock(sku: &str, qty: i64) -> Action {
    Action::new(RECEIVE_STOCK)
        .with("sku", json!(sku))
        .with("qty", json!(qty))
}

pub fn reserve_stock(sku: &str, qty: i64) -> Action {
    Action::new(RESERVE_STOCK)
        .with("sku", json!(sku))
        .with("qty", json!(qty))
}

/// `reserved` is the part of `qty` held for the shipping request.
pub fn ship_stock(sku: &str, qty: i64, reserved: i64) -> Action {
    Action::new(SHIP_STOCK)
        .with("sku", json!(sku))
        .with("qty", json!(qty))
        .with("reserved", json!(reserved))
}

pub fn new_factory_order(order: &str, sku: &str, qty: i64) -> Action {
    Action::new(NEW_FACTORY_ORDER)
        .with("order", json!(order))
        .with("sku", json!(sku))
        .with("qty", json!(qty))
}

pub fn set_stage(order: &str, stage: &str) -> Action {
    Action::new(SET_STAGE)
        .with("order", json!(order))
        .with("stage", json!(stage))
}

pub fn new_order(request: &str, customer: &str, sku: &str, qty: i64) -> Action {
    Action::new(NEW)
        .with("request", json!(request))
        .with("customer", json!(customer))
        .with("sku", json!(sku))
        .with("qty", json!(qty))
}

pub fn allocate(request: &str, sku: &str, qty: i64) -> Action {
    Action::new(ALLOCATE)
        .with("request", json!(request))
        .with("sku", json!(sku))
        .with("qty", json!(qty))
}

/// `reserved` is how much of `qty` was previously reserved for this request.
pub fn ship(request: &str, sku: &str, qty: i64, reserved: i64) -> Action {
    Action::new(SHIP)
        .with("request", json!(request))
        .with("sku", json!(sku))
        .with("qty", json!(qty))
        .with("reserved", json!(reserved))
}

pub fn reject(request: &str, reason: &str) -> Action {
    Action::new(REJECT)
        .with("request", json!(request))
        .with("reason", json!(reason))
}

/// `qty` when present and positive.
pub(crate) fn qty(action: &Action) -> Option<i64> {
    action.i64("qty").filter(|q| *q > 0)
}
