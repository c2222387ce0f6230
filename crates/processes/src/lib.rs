//! `stockflow-processes`: the business processes run on the engine.
//!
//! One `operations` store holds three slices (inventory, factory, orders);
//! the `order_to_shipment` workflow drives a customer request through them,
//! parking while the factory builds any shortfall.

pub mod actions;
pub mod factory;
pub mod inventory;
pub mod operations;
pub mod orders;
pub mod schema;
pub mod shipment;
pub mod watch;

pub use factory::{FactoryOrder, factory_order, factory_reducer};
pub use inventory::{InventoryItem, inventory_reducer};
pub use operations::{OPERATIONS, ProcessesError, operations_manager, operations_reducer, operations_store};
pub use orders::{CustomerOrder, OrderStatus, customer_order, orders_reducer};
pub use schema::{FACTORY, INVENTORY, ORDERS, operations_schema};
pub use shipment::{ORDER_TO_SHIPMENT, OrderRequest, order_to_shipment};
pub use watch::{FactoryStageWatch, OrderDocuments};
