//! `stockflow-events`: dispatch mechanics without IO.
//!
//! Actions, reducer composition, event records, workflow checkpoints and the
//! outbound bus. Storage and scheduling live in `stockflow-infra`.

pub mod action;
pub mod bus;
pub mod in_memory_bus;
pub mod info;
pub mod outbound;
pub mod processor;
pub mod record;
pub mod reducer;
pub mod tenant;

pub use action::{Action, CHECKPOINT};
pub use bus::{BusError, EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use info::{ApplyInfo, ReducerInfo, SliceInfos, absorb_apply};
pub use outbound::{OutboundEvent, SnapshotMetadata};
pub use processor::{ProcessingState, ProcessorInfo, StepOptions, WakeCondition};
pub use record::{EventRecord, RESERVED_RECORD_KEYS};
pub use reducer::{
    CombinedReduction, PassIn, PassInBinding, PassInReducer, PassInReduction, Reducer,
    ReducerError, Reduction, RootReducer, combine_reducers,
};
pub use tenant::TenantScoped;
