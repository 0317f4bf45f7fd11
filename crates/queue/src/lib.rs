//! `jobrelay-queue`: job dispatch mechanics.
//!
//! - [`JobQueue`]: the backend-agnostic dispatcher contract
//! - [`JobHandler`] / [`JobContext`]: what workers invoke, and the cancellation
//!   token every invocation receives
//! - [`MemoryQueue`]: the volatile in-process backend
//!
//! The durable Redis Streams backend lives in `jobrelay-infra` and reuses the
//! status cache, worker pool, and dispatch plumbing exported here.

pub mod dispatch;
pub mod error;
pub mod handler;
pub mod job_queue;
pub mod memory;
pub mod status_cache;
pub mod worker_pool;

pub use dispatch::{ExecutionLimits, process_job};
pub use error::QueueError;
pub use handler::{HandlerRegistry, HandlerResult, JobContext, JobHandler, SharedHandler};
pub use job_queue::JobQueue;
pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use status_cache::StatusCache;
pub use worker_pool::{ConsumerTokens, WorkerPool};
