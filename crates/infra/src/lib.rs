//! Infrastructure layer: event log backends, state stores, dispatch,
//! workflows, snapshots and background workers.

pub mod config;
pub mod event_bus;
pub mod event_log;
pub mod snapshot;
pub mod state_manager;
pub mod state_store;
pub mod workers;
pub mod workflow;

pub use config::{ConfigError, EngineConfig};
pub use event_log::{
    AttachOptions, ChangeFeed, DispatchLock, EventLog, EventLogConnection, EventLogError, InMemoryEventLog,
    PostgresEventLog, ReplayTarget, StoredSnapshot,
};
pub use snapshot::{Checkpoint, SnapshotError, SnapshotPolicy, Snapshotter, spawn_snapshotter};
pub use state_manager::{DispatchError, DispatchOutcome, StateManager};
pub use state_store::{StateStore, StoreError, StoreHandle};
pub use workers::{ShutdownSignal, TenantChanged, TenantGuard, WorkerHandle};
pub use workflow::{
    DocumentSource, InMemoryTriggerFeed, ProcessingHandle, RestartReport, RunOutcome, SharedContext, Step,
    StepContext, StepOutcome, Trigger, TriggerFeed, TriggerSource, WakeCheck, WorkflowError, WorkflowProcessor,
    spawn_feed_worker, spawn_restart_sweeper,
};
