//! `order_to_shipment`: the customer-order workflow.
//!
//! ```text
//!  trigger {id, customer?, sku, qty}
//!     │
//!  0  CreateOrder ── NEW
//!     │
//!  1  Fulfil ─┬─ enough free stock ──► ALLOCATE
//!     │       └─ shortfall ──────────► NEW_FACTORY_ORDER, park until build is "complete"
//!     │
//!  2  Ship ───┬─ stock on hand ──► SHIP
//!             └─ otherwise ──────► REJECT
//! ```
//!
//! Every step re-reads the store, so re-running one from its checkpoint
//! never duplicates the business change.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use stockflow_events::WakeCondition;
use stockflow_infra::{SharedContext, StateManager, Step, StepContext, StepOutcome, WorkflowError, WorkflowProcessor};

use crate::actions;
use crate::factory::{COMPLETE, factory_order};
use crate::inventory::item;
use crate::operations::OPERATIONS;
use crate::orders::{OrderStatus, customer_order};
use crate::schema::{FACTORY, INVENTORY, ORDERS};
use crate::watch::OrderDocuments;

pub const ORDER_TO_SHIPMENT: &str = "order_to_shipment";

/// Trigger document of one customer request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub sku: String,
    pub qty: i64,
}

impl OrderRequest {
    fn from_context(ctx: &StepContext) -> anyhow::Result<Self> {
        let mut request: Self =
            serde_json::from_value(ctx.trigger().clone()).context("trigger is not an order request")?;
        if request.qty <= 0 {
            return Err(anyhow!("order {} has non-positive qty {}", request.id, request.qty));
        }
        if request.customer.is_none() {
            request.customer = ctx.get("customer").and_then(|v| v.as_str()).map(str::to_string);
        }
        Ok(request)
    }

    fn customer(&self) -> &str {
        self.customer.as_deref().unwrap_or_default()
    }
}

fn operations(ctx: &StepContext) -> anyhow::Result<Arc<StateManager>> {
    ctx.manager(OPERATIONS)
        .cloned()
        .ok_or_else(|| anyhow!("state manager '{OPERATIONS}' is not registered"))
}

struct CreateOrder;

#[async_trait]
impl Step for CreateOrder {
    async fn run(&self, ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
        let request = OrderRequest::from_context(ctx)?;
        let ops = operations(ctx)?;

        let exists = ops
            .read(|s| s.slice(ORDERS).and_then(|o| customer_order(o, &request.id)).is_some())
            .await;
        if exists {
            debug!(request = %request.id, "order already recorded");
            return Ok(StepOutcome::next());
        }
        Ok(
            StepOutcome::act(actions::new_order(&request.id, request.customer(), &request.sku, request.qty))
                .labelled("order created"),
        )
    }
}

struct Fulfil;

#[async_trait]
impl Step for Fulfil {
    async fn run(&self, ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
        let request = OrderRequest::from_context(ctx)?;
        let ops = operations(ctx)?;

        let (status, available, building) = ops
            .read(|s| {
                let status = s
                    .slice(ORDERS)
                    .and_then(|o| customer_order(o, &request.id))
                    .map(|(_, order)| order.status);
                let available = s
                    .slice(INVENTORY)
                    .and_then(|inv| item(inv, &request.sku))
                    .map(|(_, item)| item.available())
                    .unwrap_or(0);
                let building = s
                    .slice(FACTORY)
                    .and_then(|f| factory_order(f, &request.id))
                    .is_some();
                (status, available, building)
            })
            .await;

        match status {
            None => return Err(anyhow!("order {} is missing", request.id)),
            Some(status) if status.is_closed() => return Ok(StepOutcome::finish(None)),
            Some(OrderStatus::Allocated) => return Ok(StepOutcome::next()),
            Some(_) => {}
        }

        if available >= request.qty && !building {
            return Ok(
                StepOutcome::act(actions::allocate(&request.id, &request.sku, request.qty)).labelled("stock allocated"),
            );
        }

        let build = (!building).then(|| {
            actions::new_factory_order(&request.id, &request.sku, request.qty - available.max(0))
        });
        Ok(StepOutcome::sleep_until(build, WakeCondition::stage(COMPLETE)).labelled("awaiting factory build"))
    }
}

struct Ship;

#[async_trait]
impl Step for Ship {
    async fn run(&self, ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
        let request = OrderRequest::from_context(ctx)?;
        let ops = operations(ctx)?;

        let (order, stock) = ops
            .read(|s| {
                let order = s.slice(ORDERS).and_then(|o| customer_order(o, &request.id));
                let stock = s.slice(INVENTORY).and_then(|inv| item(inv, &request.sku));
                (order, stock)
            })
            .await;
        let Some((_, order)) = order else {
            return Err(anyhow!("order {} is missing", request.id));
        };
        if order.status.is_closed() {
            return Ok(StepOutcome::finish(None));
        }

        let own_reservation = if order.status == OrderStatus::Allocated { order.qty } else { 0 };
        let free = stock
            .map(|(_, item)| item.on_hand - (item.reserved - own_reservation).max(0))
            .unwrap_or(0);
        if free >= order.qty {
            return Ok(StepOutcome::act(actions::ship(
                &request.id,
                &request.sku,
                order.qty,
                own_reservation,
            ))
            .labelled("shipped"));
        }
        Ok(StepOutcome::finish(Some(actions::reject(
            &request.id,
            &format!("only {free} of {} available", order.qty),
        ))))
    }
}

/// The workflow against `operations`, with a walk-in customer default.
pub fn order_to_shipment(operations: Arc<StateManager>) -> Result<WorkflowProcessor, WorkflowError> {
    let shared = SharedContext::new(Arc::clone(operations.connection()))
        .with_manager(Arc::clone(&operations))
        .with_default("customer", json!("walk-in"));
    Ok(WorkflowProcessor::new(ORDER_TO_SHIPMENT, Arc::clone(&operations), shared)?
        .with_documents(Arc::new(OrderDocuments::new(operations)))
        .use_step(CreateOrder)
        .use_step(Fulfil)
        .use_step(Ship))
}
