//! Command-line and environment configuration.
//!
//! ```text
//! Cli
//! ├── queue: QueueArgs    # backend, workers, buffer, deadlines, Redis stream
//! ├── log: LogArgs        # output format
//! └── command: Command    # run (default), enqueue, pending, dead-letter
//! ```
//!
//! Every queue option can also come from the environment (or a `.env` file).

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use jobrelay_infra::config::{DEFAULT_GROUP, DEFAULT_STREAM};
use jobrelay_infra::{QueueBackend, QueueConfig, RedisQueueConfig};
use jobrelay_observability::{LogConfig, LogFormat};
use jobrelay_queue::MemoryQueueConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "jobrelay-worker")]
#[command(about = "Asynchronous job dispatcher worker")]
#[command(version)]
pub struct Cli {
    #[clap(flatten)]
    pub queue: QueueArgs,

    #[clap(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Load `.env` (if present) before parsing so `env` defaults see it.
    pub fn init() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                eprintln!("Warning: failed to load .env file: {err}");
            }
        }
        Self::parse()
    }

    /// The subcommand to run; `run` when none was given.
    pub fn selected_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run(RunArgs::default()))
    }
}

/// Queue backend selection and tuning.
#[derive(Debug, Clone, Args)]
pub struct QueueArgs {
    /// Queue backend: `memory` or `redis`
    #[arg(long = "backend", env = "QUEUE_BACKEND", default_value = "memory")]
    pub backend: QueueBackend,

    /// Number of concurrent consumers
    #[arg(long = "workers", env = "QUEUE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// In-process buffer capacity
    #[arg(long = "buffer", env = "QUEUE_BUFFER", default_value_t = 1024)]
    pub buffer: usize,

    /// Per-job deadline, e.g. `30s`, `1m30s`, `500ms` (a bare number is seconds)
    #[arg(long = "job-max-duration", env = "JOB_MAX_DURATION", default_value = "30s", value_parser = parse_duration)]
    pub job_max_duration: Duration,

    #[arg(long = "redis-url", env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    #[arg(long = "stream", env = "QUEUE_STREAM", default_value = DEFAULT_STREAM)]
    pub stream: String,

    #[arg(long = "group", env = "QUEUE_GROUP", default_value = DEFAULT_GROUP)]
    pub group: String,

    /// Seconds between claimer scans
    #[arg(long = "claim-interval-secs", env = "QUEUE_CLAIM_INTERVAL_SECS", default_value_t = 10)]
    pub claim_interval_secs: u64,

    /// Seconds an entry must sit unacknowledged before it is reclaimed
    #[arg(long = "claim-timeout-secs", env = "QUEUE_CLAIM_TIMEOUT_SECS", default_value_t = 60)]
    pub claim_timeout_secs: u64,

    /// Deliveries allowed before an entry is dead-lettered
    #[arg(long = "max-retries", env = "QUEUE_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u64,

    /// Seconds `close` waits for in-flight jobs
    #[arg(long = "shutdown-grace-secs", env = "QUEUE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl QueueArgs {
    pub fn max_job_duration(&self) -> Duration {
        self.job_max_duration
    }

    pub fn to_config(&self) -> QueueConfig {
        let grace = Duration::from_secs(self.shutdown_grace_secs);

        let memory = MemoryQueueConfig::new(self.buffer, self.max_job_duration()).with_shutdown_grace(grace);

        let redis = RedisQueueConfig::new(self.stream.clone(), self.group.clone())
            .with_max_job_duration(self.max_job_duration())
            .with_claim_interval(Duration::from_secs(self.claim_interval_secs))
            .with_claim_idle_timeout(Duration::from_secs(self.claim_timeout_secs))
            .with_max_retries(self.max_retries)
            .with_shutdown_grace(grace);

        QueueConfig {
            backend: self.backend,
            redis_url: Some(self.redis_url.clone()),
            memory,
            redis,
        }
    }
}

/// Parse a duration written as unit-suffixed segments (`h`, `m`, `s`, `ms`).
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("invalid duration: empty".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {input:?}: expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let segment = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            unit => return Err(format!("invalid duration {input:?}: unknown unit {unit:?}")),
        };
        total += segment;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// Log output: `json` or `pretty`
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "json")]
    pub format: LogFormat,
}

impl LogArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig::default().with_format(self.format)
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run consumers until interrupted
    Run(RunArgs),

    /// Submit one job
    Enqueue(EnqueueArgs),

    /// Print the approximate outstanding work
    Pending,

    /// Inspect or drain the dead-letter stream (redis backend only)
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// How long the simulated handlers take per job, in milliseconds
    #[arg(long = "simulate-delay-ms", env = "SIMULATED_JOB_DELAY_MS", default_value_t = 100)]
    pub simulate_delay_ms: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self { simulate_delay_ms: 100 }
    }
}

impl RunArgs {
    pub fn simulate_delay(&self) -> Duration {
        Duration::from_millis(self.simulate_delay_ms)
    }
}

#[derive(Debug, Clone, Args)]
pub struct EnqueueArgs {
    /// Job type tag (e.g. `ekg_analyze`, `gpt_process`)
    #[arg(long = "type")]
    pub job_type: String,

    /// Payload, passed to the handler verbatim
    #[arg(long = "payload", default_value = "{}")]
    pub payload: String,

    /// Start local consumers and wait for the job to finish, then print it
    #[arg(long = "wait")]
    pub wait: bool,

    #[clap(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Clone, Subcommand)]
pub enum DeadLetterCommand {
    /// Number of dead-lettered entries
    Count,

    /// Print the oldest dead-lettered entries as JSON lines
    List {
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },

    /// Put an entry back on the main stream
    Requeue {
        /// Dead-letter stream entry id
        entry_id: String,
    },
}
