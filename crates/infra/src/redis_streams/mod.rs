//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: an entry stays pending until a worker acknowledges it
//! - **At-least-once**: entries whose worker died are reclaimed and run again
//! - **Consumer groups**: every worker process joins the same group, so each
//!   entry goes to one consumer
//! - **Dead-letter handling**: entries delivered too many times are moved to a
//!   separate stream for operator inspection
//!
//! ## Architecture
//!
//! - **Stream Key**: `jobrelay:jobs` (fields `id` and `data`, the JSON job record)
//! - **Consumer Group**: `workers`
//! - **Consumers**: `worker-1`, `worker-2`, ... each on its own connection
//! - **Claimer**: one loop that `XCLAIM`s idle pending entries to `claimer`
//! - **Dead-Letter Stream**: `jobrelay:jobs:deadletter`

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::StreamInfoGroupsReply;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use jobrelay_core::{Job, JobId};
use jobrelay_queue::{ConsumerTokens, JobQueue, QueueError, SharedHandler, StatusCache, WorkerPool};

use crate::config::RedisQueueConfig;

mod claimer;
mod consumer;
mod dead_letter;

pub use claimer::ClaimReport;
pub use dead_letter::DeadLetterEntry;

/// Entry field carrying the job id.
pub const FIELD_ID: &str = "id";

/// Entry field carrying the JSON job record.
pub const FIELD_DATA: &str = "data";

pub(crate) fn command_error(command: &str, err: redis::RedisError) -> QueueError {
    QueueError::broker(format!("{command} failed: {err}"))
}

/// Durable queue on top of a Redis stream and consumer group.
#[derive(Clone)]
pub struct RedisStreamsQueue {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    conn: ConnectionManager,
    config: RedisQueueConfig,
    dead_letter_stream: String,
    cache: StatusCache,
    pool: WorkerPool,
    /// Set by `start_consumers`; lets `claim_now` reuse the live handler.
    claim_ctx: OnceLock<(ConsumerTokens, SharedHandler)>,
}

impl RedisStreamsQueue {
    /// Open a client for `redis_url` and prepare the consumer group.
    pub async fn connect(redis_url: impl AsRef<str>, config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Config(format!("invalid redis url: {e}")))?;
        Self::new(client, config).await
    }

    /// Build the queue on an existing client.
    ///
    /// Creates the stream and consumer group if missing; an existing group is
    /// reused as is.
    pub async fn new(client: redis::Client, config: RedisQueueConfig) -> Result<Self, QueueError> {
        config.validate().map_err(|e| QueueError::Config(e.to_string()))?;

        if config.claims_live_jobs() {
            warn!(
                claim_idle_ms = config.claim_idle_timeout.as_millis() as u64,
                max_job_ms = config.limits.max_job_duration.as_millis() as u64,
                "claim idle timeout does not exceed the job deadline; slow jobs may run twice"
            );
        }

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::broker(format!("redis connection failed: {e}")))?;

        let inner = Inner {
            client,
            conn,
            dead_letter_stream: config.dead_letter_stream(),
            config,
            cache: StatusCache::new(),
            pool: WorkerPool::new(),
            claim_ctx: OnceLock::new(),
        };
        inner.ensure_group().await?;

        info!(
            stream = %inner.config.stream,
            group = %inner.config.group,
            dead_letter_stream = %inner.dead_letter_stream,
            "redis streams queue ready"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.inner.config
    }

    pub fn dead_letter_stream(&self) -> &str {
        &self.inner.dead_letter_stream
    }

    /// Run one claimer pass immediately instead of waiting for the ticker.
    ///
    /// Returns `None` if consumers have not been started.
    pub async fn claim_now(&self) -> Option<Result<ClaimReport, QueueError>> {
        let (tokens, handler) = self.inner.claim_context()?;
        Some(self.inner.claim_stuck(&tokens, &handler).await)
    }
}

impl core::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream", &self.inner.config.stream)
            .field("group", &self.inner.config.group)
            .field("dead_letter_stream", &self.inner.dead_letter_stream)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Inner {
    /// Shared multiplexed connection for non-blocking commands.
    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream if needed and `0` makes a new group see
    /// entries appended before it existed.
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.config.stream, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.config.stream, group = %self.config.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(command_error("XGROUP CREATE", e)),
        }
    }

    /// Append a job record to the stream. Returns the stream entry id.
    #[instrument(skip(self, job), fields(stream = %self.config.stream, job_id = %job.id), err)]
    async fn append(&self, job: &Job) -> Result<String, QueueError> {
        let data = job.to_json()?;
        let mut conn = self.conn();

        let entry_id: String = redis::cmd("XADD")
            .arg(&self.config.stream)
            .arg("*")
            .arg(FIELD_ID)
            .arg(job.id.to_string())
            .arg(FIELD_DATA)
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XADD", e))?;

        Ok(entry_id)
    }

    /// Acknowledge an entry (remove it from the group's pending list).
    ///
    /// Failures are logged; the entry stays pending and will be reclaimed.
    async fn ack(&self, message_id: &str) -> bool {
        let mut conn = self.conn();
        let acked: redis::RedisResult<u64> = redis::cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(message_id)
            .query_async(&mut conn)
            .await;

        match acked {
            Ok(_) => true,
            Err(e) => {
                error!(message_id, error = %e, "XACK failed; entry stays pending");
                false
            }
        }
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn();
        let info: StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.config.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XINFO GROUPS", e))?;

        Ok(info
            .groups
            .iter()
            .find(|g| g.name == self.config.group)
            .map(|g| g.pending)
            .unwrap_or(0))
    }
}

#[async_trait]
impl JobQueue for RedisStreamsQueue {
    async fn enqueue(&self, cancel: &CancellationToken, mut job: Job) -> Result<JobId, QueueError> {
        if self.inner.pool.is_closing() {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let id = job.mark_queued(Utc::now());
        // Cached before the append so a local consumer's `running` snapshot
        // can never be overwritten by this one.
        self.inner.cache.insert(job.clone());

        let appended = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            result = self.inner.append(&job) => result,
        };

        match appended {
            Ok(entry_id) => {
                debug!(job_id = %id, job_type = %job.job_type, message_id = %entry_id, "job enqueued");
                Ok(id)
            }
            Err(e) => {
                self.inner.cache.remove(id);
                Err(e)
            }
        }
    }

    fn status(&self, id: JobId) -> Option<Job> {
        self.inner.cache.get(id)
    }

    fn start_consumers(&self, shutdown: CancellationToken, workers: usize, handler: SharedHandler) {
        let Some(tokens) = self.inner.pool.start(&shutdown) else {
            return;
        };
        self.inner.remember_claim_context(&tokens, &handler);

        for worker in 1..=workers {
            let consumer = format!("{}-{worker}", self.inner.config.consumer_prefix);
            let inner = self.inner.clone();
            let tokens = tokens.clone();
            let handler = handler.clone();
            self.inner.pool.spawn(inner.consume(consumer, tokens, handler));
        }

        let inner = self.inner.clone();
        self.inner.pool.spawn(inner.claim_loop(tokens, handler));

        info!(
            count = workers,
            stream = %self.inner.config.stream,
            group = %self.inner.config.group,
            "stream consumers started"
        );
    }

    async fn len(&self) -> usize {
        match self.inner.pending_count().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not read pending count");
                0
            }
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        info!(stream = %self.inner.config.stream, "closing redis streams queue");
        if !self.inner.pool.close(self.inner.config.shutdown_grace).await {
            warn!("some jobs were abandoned; their entries stay pending for reclaim");
        }
        Ok(())
    }
}
