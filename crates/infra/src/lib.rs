//! Infrastructure layer: Redis Streams backend, dead-letter sink, backend
//! configuration and selection.

pub mod backend;
pub mod config;

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use backend::{Queue, connect};
pub use config::{ConfigError, QueueBackend, QueueConfig, RedisQueueConfig};

#[cfg(feature = "redis")]
pub use redis_streams::{ClaimReport, DeadLetterEntry, RedisStreamsQueue};
