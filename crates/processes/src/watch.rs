use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use stockflow_infra::{DocumentSource, StateManager, WakeCheck};

use crate::factory::factory_order;
use crate::orders::customer_order;
use crate::schema::{FACTORY, ORDERS};

/// Stage predicate over `factory.orders`, keyed by the requesting order id.
#[derive(Debug, Clone)]
pub struct FactoryStageWatch {
    operations: Arc<StateManager>,
}

impl FactoryStageWatch {
    pub fn new(operations: Arc<StateManager>) -> Self {
        Self { operations }
    }
}

#[async_trait]
impl WakeCheck for FactoryStageWatch {
    async fn stage_reached(&self, doc_id: &str, stage: &str) -> anyhow::Result<bool> {
        let reached = self
            .operations
            .read(|s| {
                s.slice(FACTORY)
                    .and_then(|f| factory_order(f, doc_id))
                    .is_some_and(|(_, order)| order.stage == stage)
            })
            .await;
        Ok(reached)
    }
}

/// Resolves `{docId}` triggers to the recorded customer order.
#[derive(Debug, Clone)]
pub struct OrderDocuments {
    operations: Arc<StateManager>,
}

impl OrderDocuments {
    pub fn new(operations: Arc<StateManager>) -> Self {
        Self { operations }
    }
}

#[async_trait]
impl DocumentSource for OrderDocuments {
    async fn fetch(&self, doc_id: &str) -> anyhow::Result<Option<JsonValue>> {
        let order = self
            .operations
            .read(|s| s.slice(ORDERS).and_then(|o| customer_order(o, doc_id)))
            .await;
        Ok(order.map(|(_, order)| {
            json!({
                "id": order.request,
                "customer": order.customer,
                "sku": order.sku,
                "qty": order.qty,
            })
        }))
    }
}
