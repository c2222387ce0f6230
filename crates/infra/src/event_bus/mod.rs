//! Infrastructure-backed outbound buses.
//!
//! The bus abstraction lives in `stockflow-events` as pure mechanics. This
//! module provides the Redis-backed implementation behind the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubEventBus;
