//! Backend-agnostic job dispatcher contract.
//!
//! Producers, status readers, and the worker bootstrap only ever see
//! `Arc<dyn JobQueue>`; which backend sits behind it is a configuration
//! choice.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a job may run more than once after a crash or a
//!   reclaim; handlers must be idempotent
//! - **No ordering across workers**: delivery is FIFO, completion is not
//! - **Status is local**: `status` reads this process's cache, which is not
//!   rebuilt from durable storage after a restart

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use jobrelay_core::{Job, JobId};

use crate::error::QueueError;
use crate::handler::SharedHandler;

/// Uniform operations implemented by every queue backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job.
    ///
    /// Assigns an id when the job has none, stamps `queued` and `enqueued_at`,
    /// and makes the job visible to workers. Returns
    /// [`QueueError::Cancelled`] if `cancel` fires before the job is accepted.
    async fn enqueue(&self, cancel: &CancellationToken, job: Job) -> Result<JobId, QueueError>;

    /// Last known snapshot of a job, if this process has seen it.
    fn status(&self, id: JobId) -> Option<Job>;

    /// Launch `workers` consumer loops invoking `handler`.
    ///
    /// Effective on the first call only. Loops exit when `shutdown` fires or
    /// the queue is closed. Must be called from within a Tokio runtime.
    fn start_consumers(&self, shutdown: CancellationToken, workers: usize, handler: SharedHandler);

    /// Approximate outstanding work. Advisory only.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop accepting work and wait (bounded) for consumers to exit.
    async fn close(&self) -> Result<(), QueueError>;
}
