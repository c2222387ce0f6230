//! Background tasks: change-feed followers, tenant guard, periodic sweeps.

pub(crate) mod follower;
pub mod handle;
pub mod tenant_guard;

pub use handle::{ShutdownSignal, WorkerHandle};
pub use tenant_guard::{TenantChanged, TenantGuard};
