//! In-process queue backend for tests/dev.
//!
//! - Bounded buffer: producers wait for room (or fail fast with `try_enqueue`)
//! - Status map behind a reader/writer lock
//! - **Volatile**: a crash drops buffered and in-flight jobs

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use jobrelay_core::{Job, JobId};

use crate::dispatch::{ExecutionLimits, process_job};
use crate::error::QueueError;
use crate::handler::SharedHandler;
use crate::job_queue::JobQueue;
use crate::status_cache::StatusCache;
use crate::worker_pool::{ConsumerTokens, WorkerPool};

/// In-process queue configuration.
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// Buffer capacity (backpressure threshold)
    pub capacity: usize,
    /// Per-job deadline and cancel grace
    pub limits: ExecutionLimits,
    /// How long `close` waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            limits: ExecutionLimits::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl MemoryQueueConfig {
    pub fn new(capacity: usize, max_job_duration: Duration) -> Self {
        Self {
            capacity,
            limits: ExecutionLimits::new(max_job_duration),
            ..Default::default()
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.limits.cancel_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Volatile bounded queue with a worker pool.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: mpsc::Sender<Job>,
    rx: Mutex<mpsc::Receiver<Job>>,
    cache: StatusCache,
    config: MemoryQueueConfig,
    pool: WorkerPool,
    in_flight: AtomicUsize,
}

impl MemoryQueue {
    /// Create a queue. A zero capacity is raised to one.
    pub fn new(config: MemoryQueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                cache: StatusCache::with_capacity(capacity),
                config,
                pool: WorkerPool::new(),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Submit without waiting for buffer space.
    pub fn try_enqueue(&self, mut job: Job) -> Result<JobId, QueueError> {
        if self.inner.pool.is_closing() {
            return Err(QueueError::Closed);
        }

        let permit = self.inner.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => QueueError::Full,
            mpsc::error::TrySendError::Closed(()) => QueueError::Closed,
        })?;

        Ok(self.inner.accept(permit, &mut job))
    }

    /// Jobs waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    /// Jobs currently inside a handler.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn accept(&self, permit: mpsc::Permit<'_, Job>, job: &mut Job) -> JobId {
        let id = job.mark_queued(Utc::now());
        // Visible to `status` before any worker can pick it up.
        self.cache.insert(job.clone());
        permit.send(job.clone());

        debug!(job_id = %id, job_type = %job.job_type, "job enqueued");
        id
    }

    async fn consume(self: Arc<Self>, worker: usize, tokens: ConsumerTokens, handler: SharedHandler) {
        let name = format!("worker-{worker}");
        debug!(worker = %name, "memory consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = tokens.stop.cancelled() => break,
                job = async { self.rx.lock().await.recv().await } => job,
            };

            let Some(job) = next else {
                break;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            process_job(
                handler.as_ref(),
                &tokens.root,
                self.config.limits,
                &self.cache,
                job,
                &name,
            )
            .await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(worker = %name, "memory consumer stopped");
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, cancel: &CancellationToken, mut job: Job) -> Result<JobId, QueueError> {
        if self.inner.pool.is_closing() {
            return Err(QueueError::Closed);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            _ = self.inner.pool.closed() => return Err(QueueError::Closed),
            permit = self.inner.tx.reserve() => permit.map_err(|_| QueueError::Closed)?,
        };

        // `close` may have started while we waited for room.
        if self.inner.pool.is_closing() {
            return Err(QueueError::Closed);
        }

        Ok(self.inner.accept(permit, &mut job))
    }

    fn status(&self, id: JobId) -> Option<Job> {
        self.inner.cache.get(id)
    }

    fn start_consumers(&self, shutdown: CancellationToken, workers: usize, handler: SharedHandler) {
        let Some(tokens) = self.inner.pool.start(&shutdown) else {
            return;
        };

        for worker in 1..=workers {
            let inner = self.inner.clone();
            self.inner
                .pool
                .spawn(inner.consume(worker, tokens.clone(), handler.clone()));
        }

        info!(count = workers, capacity = self.inner.tx.max_capacity(), "started memory queue consumers");
    }

    async fn len(&self) -> usize {
        self.buffered() + self.in_flight()
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.pool.close(self.inner.config.shutdown_grace).await;
        info!(buffered = self.buffered(), "memory queue closed");
        Ok(())
    }
}
