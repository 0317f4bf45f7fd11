//! Backend selection.
//!
//! [`connect`] turns a [`QueueConfig`] into a [`Queue`], which implements
//! [`JobQueue`] by delegating to the chosen backend. Code that needs a
//! backend-specific operation (dead-letter inspection) matches on the variant.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use jobrelay_core::{Job, JobId};
use jobrelay_queue::{JobQueue, MemoryQueue, QueueError, SharedHandler};

use crate::config::{ConfigError, QueueBackend, QueueConfig};

#[cfg(feature = "redis")]
use crate::redis_streams::RedisStreamsQueue;

impl From<ConfigError> for QueueError {
    fn from(value: ConfigError) -> Self {
        QueueError::Config(value.to_string())
    }
}

/// A configured dispatcher.
#[derive(Debug, Clone)]
pub enum Queue {
    Memory(MemoryQueue),
    #[cfg(feature = "redis")]
    RedisStreams(RedisStreamsQueue),
}

impl Queue {
    pub fn backend(&self) -> QueueBackend {
        match self {
            Queue::Memory(_) => QueueBackend::Memory,
            #[cfg(feature = "redis")]
            Queue::RedisStreams(_) => QueueBackend::RedisStreams,
        }
    }

    /// The durable backend, if that is what was configured.
    #[cfg(feature = "redis")]
    pub fn as_redis(&self) -> Option<&RedisStreamsQueue> {
        match self {
            Queue::RedisStreams(queue) => Some(queue),
            _ => None,
        }
    }

    /// Type-erase for callers that only need the contract.
    pub fn into_shared(self) -> Arc<dyn JobQueue> {
        match self {
            Queue::Memory(queue) => Arc::new(queue),
            #[cfg(feature = "redis")]
            Queue::RedisStreams(queue) => Arc::new(queue),
        }
    }

    fn inner(&self) -> &dyn JobQueue {
        match self {
            Queue::Memory(queue) => queue,
            #[cfg(feature = "redis")]
            Queue::RedisStreams(queue) => queue,
        }
    }
}

/// Build the backend named by `config.backend`.
pub async fn connect(config: &QueueConfig) -> Result<Queue, QueueError> {
    let queue = match config.backend {
        QueueBackend::Memory => Queue::Memory(MemoryQueue::new(config.memory.clone())),
        #[cfg(feature = "redis")]
        QueueBackend::RedisStreams => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("redis backend requires a redis url".into()))?;
            Queue::RedisStreams(RedisStreamsQueue::connect(url, config.redis.clone()).await?)
        }
        #[cfg(not(feature = "redis"))]
        QueueBackend::RedisStreams => {
            return Err(ConfigError::Invalid("built without redis support".into()).into());
        }
    };

    info!(backend = %queue.backend(), "job queue initialized");
    Ok(queue)
}

#[async_trait]
impl JobQueue for Queue {
    async fn enqueue(&self, cancel: &CancellationToken, job: Job) -> Result<JobId, QueueError> {
        self.inner().enqueue(cancel, job).await
    }

    fn status(&self, id: JobId) -> Option<Job> {
        self.inner().status(id)
    }

    fn start_consumers(&self, shutdown: CancellationToken, workers: usize, handler: SharedHandler) {
        self.inner().start_consumers(shutdown, workers, handler)
    }

    async fn len(&self) -> usize {
        self.inner().len().await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::JobStatus;
    use jobrelay_queue::MemoryQueueConfig;

    #[tokio::test]
    async fn memory_backend_needs_no_broker() {
        let queue = connect(&QueueConfig::memory(MemoryQueueConfig::default())).await.unwrap();
        assert_eq!(queue.backend(), QueueBackend::Memory);

        let id = queue
            .enqueue(&CancellationToken::new(), Job::new("test", b"{}".to_vec()))
            .await
            .unwrap();

        assert_eq!(queue.status(id).unwrap().status, JobStatus::Queued);
        assert_eq!(queue.len().await, 1);
        queue.close().await.unwrap();
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn redis_backend_requires_url() {
        let config = QueueConfig {
            backend: QueueBackend::RedisStreams,
            redis_url: None,
            ..Default::default()
        };

        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, QueueError::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn shared_handle_delegates() {
        let queue = connect(&QueueConfig::default()).await.unwrap().into_shared();
        queue.close().await.unwrap();

        let err = queue
            .enqueue(&CancellationToken::new(), Job::new("test", Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Closed);
    }
}
