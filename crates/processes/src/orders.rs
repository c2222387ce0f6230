//! Customer orders slice.
//!
//! A pass-in reducer targeting `inventory`: allocating or shipping an order
//! and the stock movement behind it land in the same record, or neither does.

use serde::{Deserialize, Serialize};
use serde_json::json;

use stockflow_core::{SliceState, StateUpdate};
use stockflow_events::{Action, PassIn, PassInReduction, Reduction};

use crate::actions::{self, qty};
use crate::schema::{failure, find_item};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Allocated,
    Shipped,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Allocated => "allocated",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, OrderStatus::Shipped | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerOrder {
    pub request: String,
    #[serde(default)]
    pub customer: String,
    pub sku: String,
    pub qty: i64,
    pub status: OrderStatus,
}

pub fn customer_order(state: &SliceState, request: &str) -> Option<(u64, CustomerOrder)> {
    find_item(state, "orders", "request", request)
}

/// Orders drive inventory: `ALLOCATE` reserves stock and `SHIP` takes it,
/// and the order only moves when inventory accepts the change.
pub fn orders_reducer(state: &SliceState, action: &Action, inventory: &PassIn<'_>) -> PassInReduction {
    match action.action_type() {
        actions::NEW => PassInReduction::own(new_order(state, action)),
        actions::ALLOCATE => move_stock(state, action, OrderStatus::Allocated, inventory),
        actions::SHIP => move_stock(state, action, OrderStatus::Shipped, inventory),
        actions::REJECT => PassInReduction::own(match open_order(state, action) {
            Ok((id, _)) => transition(id, action, OrderStatus::Rejected),
            Err(message) => failure(action, message, vec![]),
        }),
        _ => PassInReduction::own(Reduction::none()),
    }
}

fn new_order(state: &SliceState, action: &Action) -> Reduction {
    let (Some(request), Some(sku), Some(qty)) = (action.str("request"), action.str("sku"), qty(action)) else {
        return failure(action, "NEW requires request, sku and a positive qty", vec![]);
    };
    if customer_order(state, request).is_some() {
        return failure(action, format!("order {request} already exists"), vec![]);
    }
    let customer = action.str("customer").unwrap_or_default();
    Reduction::update(StateUpdate::add(
        "orders",
        json!({
            "request": request,
            "customer": customer,
            "sku": sku,
            "qty": qty,
            "status": OrderStatus::New.as_str(),
        }),
    ))
}

/// The order named by the action, if it can still change.
fn open_order(state: &SliceState, action: &Action) -> Result<(u64, CustomerOrder), String> {
    let Some(request) = action.str("request") else {
        return Err(format!("{} requires a request", action.action_type()));
    };
    let Some((id, current)) = customer_order(state, request) else {
        return Err(format!("unknown order {request}"));
    };
    if current.status.is_closed() {
        return Err(format!("order {request} is already {}", current.status.as_str()));
    }
    Ok((id, current))
}

/// Stock moves for the order's own SKU; `qty` on the action overrides the
/// ordered quantity.
fn move_stock(state: &SliceState, action: &Action, to: OrderStatus, inventory: &PassIn<'_>) -> PassInReduction {
    let (id, order) = match open_order(state, action) {
        Ok(found) => found,
        Err(message) => return PassInReduction::own(failure(action, message, vec![])),
    };
    let qty = qty(action).unwrap_or(order.qty);
    let stock = match to {
        OrderStatus::Allocated => actions::reserve_stock(&order.sku, qty),
        _ => actions::ship_stock(&order.sku, qty, action.i64("reserved").unwrap_or(0)),
    }
    .with("request", json!(order.request));

    let passed = inventory.reduce(&stock);
    if passed.info.failed {
        let reason = passed.info.message.clone().unwrap_or_default();
        let own = failure(
            action,
            format!("order {} not {}: {reason}", order.request, to.as_str()),
            vec![],
        );
        return PassInReduction::both(own, passed);
    }
    PassInReduction::both(transition(id, action, to), passed)
}

fn transition(id: u64, action: &Action, to: OrderStatus) -> Reduction {
    let mut set = json!({"status": to.as_str()});
    if let (OrderStatus::Rejected, Some(reason)) = (to, action.str("reason")) {
        set["reason"] = json!(reason);
    }
    let mut updates = vec![StateUpdate::update_item("orders", id, json!({"$set": set}))];
    if to == OrderStatus::Shipped {
        updates.push(StateUpdate::inc("shipped"));
    }
    Reduction::updates(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::operations_reducer;
    use crate::schema::{INVENTORY, LAST_FAILURE, ORDERS, operations_schema};
    use stockflow_core::{ListValue, Method, PathValue, StoreState};
    use stockflow_events::CombinedReduction;

    fn state_with(status: OrderStatus, on_hand: i64) -> StoreState {
        let schema = operations_schema().unwrap();
        let mut state = StoreState::initial(&schema);

        let mut orders = ListValue::default();
        let id = orders.allocate();
        orders.insert(
            id,
            json!({"id": id, "request": "R-1", "customer": "acme", "sku": "A-1", "qty": 2, "status": status.as_str()}),
        );
        state.set_path(ORDERS, "orders", PathValue::List(orders));

        let mut items = ListValue::default();
        let id = items.allocate();
        items.insert(
            id,
            json!({"id": id, "sku": "A-1", "name": "Widget", "on_hand": on_hand, "reserved": 2}),
        );
        state.set_path(INVENTORY, "items", PathValue::List(items));
        state
    }

    fn reduce(state: &StoreState, action: &Action) -> CombinedReduction {
        operations_reducer().unwrap().reduce(state, action)
    }

    #[test]
    fn duplicate_requests_fail() {
        let r = reduce(&state_with(OrderStatus::New, 5), &actions::new_order("R-1", "acme", "A-1", 2));
        assert!(r.infos[ORDERS].failed);
        let updates = r.changes.get(ORDERS).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, LAST_FAILURE);
    }

    #[test]
    fn shipping_counts_once() {
        let r = reduce(&state_with(OrderStatus::Allocated, 5), &actions::ship("R-1", "A-1", 2, 2));
        assert!(!r.infos[ORDERS].failed);
        let updates = r.changes.get(ORDERS).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].method, Method::Inc);
        assert_eq!(
            r.changes.get(INVENTORY).unwrap()[0].doc,
            Some(json!({"$set": {"on_hand": 3, "reserved": 0}}))
        );

        let again = reduce(&state_with(OrderStatus::Shipped, 5), &actions::ship("R-1", "A-1", 2, 2));
        assert!(again.infos[ORDERS].failed);
        assert!(again.changes.get(INVENTORY).is_none());
        assert!(again.changes.get(ORDERS).unwrap().iter().all(|u| u.method != Method::Inc));
    }

    #[test]
    fn shipping_without_stock_leaves_the_order_open() {
        let r = reduce(&state_with(OrderStatus::Allocated, 1), &actions::ship("R-1", "A-1", 2, 2));
        assert!(r.infos[ORDERS].failed);
        assert!(r.infos[INVENTORY].failed);

        let orders = r.changes.get(ORDERS).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].path, LAST_FAILURE);
        let inventory = r.changes.get(INVENTORY).unwrap();
        assert!(inventory.iter().all(|u| u.path == LAST_FAILURE));
    }

    #[test]
    fn allocation_needs_free_stock() {
        // Two units are already held for another request.
        let short = reduce(&state_with(OrderStatus::New, 3), &actions::allocate("R-1", "A-1", 2));
        assert!(short.infos[ORDERS].failed);
        assert_eq!(short.changes.get(ORDERS).unwrap()[0].path, LAST_FAILURE);
        assert_eq!(
            short.changes.get(INVENTORY).unwrap()[0].doc,
            Some(json!({"$set": {"shortfall": 1}}))
        );

        let ok = reduce(&state_with(OrderStatus::New, 5), &actions::allocate("R-1", "A-1", 2));
        assert!(!ok.infos[ORDERS].failed);
        assert_eq!(
            ok.changes.get(ORDERS).unwrap()[0].doc,
            Some(json!({"$set": {"status": "allocated"}}))
        );
        assert_eq!(
            ok.changes.get(INVENTORY).unwrap()[0].doc,
            Some(json!({"$set": {"reserved": 4, "shortfall": 0}}))
        );
    }

    #[test]
    fn reject_records_the_reason() {
        let r = reduce(&state_with(OrderStatus::New, 5), &actions::reject("R-1", "out of stock"));
        assert_eq!(
            r.changes.get(ORDERS).unwrap()[0].doc,
            Some(json!({"$set": {"status": "rejected", "reason": "out of stock"}}))
        );
        assert!(r.changes.get(INVENTORY).is_none());
    }
}
