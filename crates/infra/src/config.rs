//! Backend configuration and representation.
//!
//! - [`QueueBackend`]: which dispatcher implementation to build
//! - [`RedisQueueConfig`]: stream/group naming and the claimer's timing knobs
//! - [`QueueConfig`]: everything [`crate::connect`] needs

use std::str::FromStr;
use std::time::Duration;

use jobrelay_queue::{ExecutionLimits, MemoryQueueConfig};

/// Default stream key for jobs
pub const DEFAULT_STREAM: &str = "jobrelay:jobs";

/// Default consumer group
pub const DEFAULT_GROUP: &str = "workers";

/// Suffix appended to the stream key to name the dead-letter stream
pub const DEAD_LETTER_SUFFIX: &str = ":deadletter";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown queue backend: {0} (expected `memory` or `redis`)")]
    UnknownBackend(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatcher implementation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
    /// Volatile in-process queue
    #[default]
    Memory,
    /// Durable Redis Streams queue
    RedisStreams,
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::Memory => "memory",
            QueueBackend::RedisStreams => "redis",
        }
    }
}

impl core::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" | "in-memory" => Ok(QueueBackend::Memory),
            "redis" | "redis-streams" | "redis_streams" | "streams" => Ok(QueueBackend::RedisStreams),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Redis Streams queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisQueueConfig {
    /// Stream key jobs are appended to
    pub stream: String,
    /// Consumer group shared by all workers
    pub group: String,
    /// Consumers are named `<consumer_prefix>-<n>`
    pub consumer_prefix: String,
    /// Consumer identity that reclaimed entries are transferred to
    pub claimer_name: String,
    /// Dead-letter stream; `<stream>:deadletter` when unset
    pub dead_letter_stream: Option<String>,
    /// Per-job deadline and cancel grace
    pub limits: ExecutionLimits,
    /// How long one `XREADGROUP` blocks before looping
    pub read_block: Duration,
    /// How often the claimer scans the pending list
    pub claim_interval: Duration,
    /// Minimum idle time before a pending entry is reclaimed
    pub claim_idle_timeout: Duration,
    /// Maximum pending entries inspected per scan
    pub claim_batch: usize,
    /// Deliveries beyond this count send the entry to the dead-letter stream
    pub max_retries: u64,
    /// Pause after a failed broker read
    pub error_backoff: Duration,
    /// How long `close` waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer_prefix: "worker".to_string(),
            claimer_name: "claimer".to_string(),
            dead_letter_stream: None,
            limits: ExecutionLimits::default(),
            read_block: Duration::from_secs(2),
            claim_interval: Duration::from_secs(10),
            claim_idle_timeout: Duration::from_secs(60),
            claim_batch: 100,
            max_retries: 3,
            error_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RedisQueueConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            ..Default::default()
        }
    }

    /// Effective dead-letter stream key.
    pub fn dead_letter_stream(&self) -> String {
        self.dead_letter_stream
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.stream, DEAD_LETTER_SUFFIX))
    }

    pub fn with_dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter_stream = Some(stream.into());
        self
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    pub fn with_max_job_duration(mut self, duration: Duration) -> Self {
        self.limits.max_job_duration = duration;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.limits.cancel_grace = grace;
        self
    }

    pub fn with_read_block(mut self, block: Duration) -> Self {
        self.read_block = block;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_claim_idle_timeout(mut self, timeout: Duration) -> Self {
        self.claim_idle_timeout = timeout;
        self
    }

    pub fn with_claim_batch(mut self, batch: usize) -> Self {
        self.claim_batch = batch;
        self
    }

    pub fn with_max_retries(mut self, retries: u64) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject settings the claimer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.is_empty() {
            return Err(ConfigError::Invalid("stream must not be empty".into()));
        }
        if self.group.is_empty() {
            return Err(ConfigError::Invalid("group must not be empty".into()));
        }
        if self.dead_letter_stream() == self.stream {
            return Err(ConfigError::Invalid(
                "dead-letter stream must differ from the job stream".into(),
            ));
        }
        if self.claim_interval.is_zero() {
            return Err(ConfigError::Invalid("claim_interval must be positive".into()));
        }
        if self.claim_batch == 0 {
            return Err(ConfigError::Invalid("claim_batch must be positive".into()));
        }
        Ok(())
    }

    /// Whether a live job could be reclaimed while its handler still runs.
    pub fn claims_live_jobs(&self) -> bool {
        self.claim_idle_timeout <= self.limits.max_job_duration + self.limits.cancel_grace
    }
}

/// Everything needed to build a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Broker URL; only read by the Redis backend
    pub redis_url: Option<String>,
    pub memory: MemoryQueueConfig,
    pub redis: RedisQueueConfig,
}

impl QueueConfig {
    pub fn memory(config: MemoryQueueConfig) -> Self {
        Self {
            backend: QueueBackend::Memory,
            memory: config,
            ..Default::default()
        }
    }

    pub fn redis(url: impl Into<String>, config: RedisQueueConfig) -> Self {
        Self {
            backend: QueueBackend::RedisStreams,
            redis_url: Some(url.into()),
            redis: config,
            ..Default::default()
        }
    }

    /// Apply one per-job deadline to whichever backend is selected.
    pub fn with_max_job_duration(mut self, duration: Duration) -> Self {
        self.memory.limits.max_job_duration = duration;
        self.redis.limits.max_job_duration = duration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RedisQueueConfig::default();

        assert_eq!(config.stream, "jobrelay:jobs");
        assert_eq!(config.group, "workers");
        assert_eq!(config.limits.max_job_duration, Duration::from_secs(30));
        assert_eq!(config.read_block, Duration::from_secs(2));
        assert_eq!(config.claim_interval, Duration::from_secs(10));
        assert_eq!(config.claim_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.claim_batch, 100);
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dead_letter_stream_derives_from_stream() {
        let config = RedisQueueConfig::new("ekg:jobs", "workers");
        assert_eq!(config.dead_letter_stream(), "ekg:jobs:deadletter");

        let config = config.with_dead_letter_stream("ekg:dlq");
        assert_eq!(config.dead_letter_stream(), "ekg:dlq");
    }

    #[test]
    fn validate_rejects_dead_letter_stream_equal_to_stream() {
        let config = RedisQueueConfig::new("jobs", "g").with_dead_letter_stream("jobs");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_idle_threshold_exceeds_job_deadline() {
        assert!(!RedisQueueConfig::default().claims_live_jobs());

        let tight = RedisQueueConfig::default().with_claim_idle_timeout(Duration::from_secs(5));
        assert!(tight.claims_live_jobs());
    }

    #[test]
    fn backend_parses_common_spellings() {
        assert_eq!("memory".parse::<QueueBackend>().unwrap(), QueueBackend::Memory);
        assert_eq!("Redis".parse::<QueueBackend>().unwrap(), QueueBackend::RedisStreams);
        assert_eq!("redis-streams".parse::<QueueBackend>().unwrap(), QueueBackend::RedisStreams);
        assert_eq!(
            "kafka".parse::<QueueBackend>(),
            Err(ConfigError::UnknownBackend("kafka".into()))
        );
    }

    #[test]
    fn max_job_duration_applies_to_both_backends() {
        let config = QueueConfig::default().with_max_job_duration(Duration::from_secs(7));
        assert_eq!(config.memory.limits.max_job_duration, Duration::from_secs(7));
        assert_eq!(config.redis.limits.max_job_duration, Duration::from_secs(7));
    }
}
