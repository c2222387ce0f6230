//! `stockflow-core`: engine foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): the
//! schema language, the declarative update vocabulary and the materialized
//! value space that reducers read.

pub mod error;
pub mod id;
pub mod schema;
pub mod state;
pub mod update;

pub use error::{StateError, StateResult};
pub use id::TenantId;
pub use schema::{
    IdentifierFormat, PathSchema, SchemaDefinition, SliceSchema, ValueKind, CHANGE_COUNT,
    CONTROL_SLICE, LOG_SEQUENCE,
};
pub use state::{ListValue, PathValue, SliceState, StoreState};
pub use update::{Filter, Method, SliceChanges, StateChanges, StateUpdate};
