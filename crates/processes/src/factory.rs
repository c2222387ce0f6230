//! Factory slice: build orders moving through stages.
//!
//! Completing a build is one business event touching two slices: the factory
//! order's stage and the inventory it produced. The factory reducer is a
//! pass-in reducer targeting `inventory`, so both land in the same record.

use serde::{Deserialize, Serialize};
use serde_json::json;

use stockflow_core::{SliceState, StateUpdate};
use stockflow_events::{Action, PassIn, PassInReduction, Reduction};

use crate::actions::{self, qty};
use crate::schema::{failure, find_item};

/// Stage reached when the built stock is in inventory.
pub const COMPLETE: &str = "complete";
pub const QUEUED: &str = "queued";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryOrder {
    /// Id of the customer request that caused the build.
    pub order: String,
    pub sku: String,
    pub qty: i64,
    pub stage: String,
}

impl FactoryOrder {
    pub fn is_complete(&self) -> bool {
        self.stage == COMPLETE
    }
}

pub fn factory_order(state: &SliceState, order: &str) -> Option<(u64, FactoryOrder)> {
    find_item(state, "orders", "order", order)
}

pub fn factory_reducer(state: &SliceState, action: &Action, inventory: &PassIn<'_>) -> PassInReduction {
    match action.action_type() {
        actions::NEW_FACTORY_ORDER => PassInReduction::own(new_factory_order(state, action)),
        actions::SET_STAGE => set_stage(state, action, inventory),
        _ => PassInReduction::own(Reduction::none()),
    }
}

fn new_factory_order(state: &SliceState, action: &Action) -> Reduction {
    let (Some(order), Some(sku), Some(qty)) = (action.str("order"), action.str("sku"), qty(action)) else {
        return failure(action, "NEW_FACTORY_ORDER requires order, sku and a positive qty", vec![]);
    };
    if factory_order(state, order).is_some() {
        return failure(action, format!("factory order for {order} already exists"), vec![]);
    }
    Reduction::update(StateUpdate::add(
        "orders",
        json!({"order": order, "sku": sku, "qty": qty, "stage": QUEUED}),
    ))
}

fn set_stage(state: &SliceState, action: &Action, inventory: &PassIn<'_>) -> PassInReduction {
    let (Some(order), Some(stage)) = (action.str("order"), action.str("stage")) else {
        return PassInReduction::own(failure(action, "SET_STAGE requires order and stage", vec![]));
    };
    let Some((id, current)) = factory_order(state, order) else {
        return PassInReduction::own(failure(action, format!("no factory order for {order}"), vec![]));
    };
    if current.is_complete() {
        return PassInReduction::own(failure(
            action,
            format!("factory order for {order} is already complete"),
            vec![],
        ));
    }

    let staged = StateUpdate::update_item("orders", id, json!({"$set": {"stage": stage}}));
    if stage != COMPLETE {
        return PassInReduction::own(Reduction::update(staged));
    }

    let built = Action::new(actions::INVENTORY_COMPLETE)
        .with("sku", json!(current.sku))
        .with("qty", json!(current.qty))
        .with("order", json!(order));
    let passed = inventory.reduce(&built);
    if passed.info.failed {
        let reason = passed.info.message.clone().unwrap_or_default();
        return PassInReduction::both(
            failure(action, format!("factory order for {order} not completed: {reason}"), vec![]),
            passed,
        );
    }
    PassInReduction::both(
        Reduction::updates(vec![staged, StateUpdate::inc("completed")]),
        passed,
    )
}
