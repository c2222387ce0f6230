//! Append-only, tenant-partitioned event log.
//!
//! This module provides the log abstraction, an in-memory implementation for
//! tests/dev, a Postgres implementation, and the per-process connection that
//! serializes writes and replays records into state.

pub mod connection;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use connection::{AttachOptions, DispatchLock, EventLogConnection, ReplayTarget};
pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use r#trait::{ChangeFeed, EventLog, EventLogError, StoredSnapshot};
