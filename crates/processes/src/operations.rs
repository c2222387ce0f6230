//! The `operations` state manager: inventory, factory and orders in one store.

use std::sync::Arc;

use thiserror::Error;

use stockflow_core::{SchemaDefinition, StateError};
use stockflow_events::{PassInBinding, Reducer, ReducerError, RootReducer, combine_reducers};
use stockflow_infra::state_store::StoreBackend;
use stockflow_infra::{DispatchError, EventLogConnection, StateManager, StateStore, StoreError, StoreHandle};

use crate::factory::factory_reducer;
use crate::inventory::inventory_reducer;
use crate::orders::orders_reducer;
use crate::schema::{FACTORY, INVENTORY, ORDERS, operations_schema};

pub const OPERATIONS: &str = "operations";

#[derive(Debug, Error)]
pub enum ProcessesError {
    #[error(transparent)]
    Schema(#[from] StateError),

    #[error(transparent)]
    Reducer(#[from] ReducerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub fn operations_reducer() -> Result<RootReducer, ReducerError> {
    let inventory: Arc<dyn Reducer> = Arc::new(inventory_reducer);
    combine_reducers(
        vec![(INVENTORY.to_string(), inventory)],
        vec![
            PassInBinding::new(FACTORY, INVENTORY, factory_reducer),
            PassInBinding::new(ORDERS, INVENTORY, orders_reducer),
        ],
    )
}

/// Store for the `operations` manager; `backend` of `None` keeps it in memory.
pub async fn operations_store(backend: Option<Arc<dyn StoreBackend>>) -> Result<StoreHandle, ProcessesError> {
    let schema: Arc<SchemaDefinition> = Arc::new(operations_schema()?);
    let store = match backend {
        Some(backend) => StateStore::open(OPERATIONS, schema, backend).await?,
        None => StateStore::in_memory(OPERATIONS, schema),
    };
    Ok(StoreHandle::new(store))
}

pub fn operations_manager(
    connection: Arc<EventLogConnection>,
    store: StoreHandle,
) -> Result<StateManager, ProcessesError> {
    Ok(StateManager::new(OPERATIONS, connection, store, operations_reducer()?)?)
}
