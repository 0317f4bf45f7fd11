//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use jobrelay_core::{Job, JobId};
use jobrelay_infra::{Queue, QueueBackend, QueueConfig, RedisStreamsQueue, connect};
use jobrelay_queue::JobQueue;

use crate::cli::{Cli, Command, DeadLetterCommand, EnqueueArgs, RunArgs};
use crate::handlers;
use crate::shutdown::shutdown_signal;

/// Execute the selected subcommand.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.queue.to_config();

    match cli.selected_command() {
        Command::Run(args) => run_workers(&config, cli.queue.workers, &args).await,
        Command::Enqueue(args) => enqueue(&config, cli.queue.workers, &args).await,
        Command::Pending => pending(&config).await,
        Command::DeadLetter(action) => dead_letter(&config, action).await,
    }
}

async fn open(config: &QueueConfig) -> anyhow::Result<Queue> {
    connect(config)
        .await
        .with_context(|| format!("failed to initialize {} queue", config.backend))
}

async fn run_workers(config: &QueueConfig, workers: usize, args: &RunArgs) -> anyhow::Result<()> {
    let queue = open(config).await?;
    let shutdown = CancellationToken::new();

    queue.start_consumers(
        shutdown.clone(),
        workers,
        Arc::new(handlers::registry(args.simulate_delay())),
    );
    info!(backend = %queue.backend(), workers, "worker running");

    shutdown_signal().await;

    queue.close().await.context("failed to close queue")?;
    shutdown.cancel();
    info!("worker stopped");
    Ok(())
}

async fn enqueue(config: &QueueConfig, workers: usize, args: &EnqueueArgs) -> anyhow::Result<()> {
    if !args.wait && config.backend == QueueBackend::Memory {
        bail!("the memory backend drops jobs on exit; pass --wait or use --backend redis");
    }

    let queue = open(config).await?;
    let job = Job::new(args.job_type.as_str(), args.payload.clone().into_bytes());

    let cancel = CancellationToken::new();
    let id = queue.enqueue(&cancel, job).await.context("enqueue failed")?;
    info!(job_id = %id, job_type = %args.job_type, "job enqueued");

    if !args.wait {
        println!("{id}");
        queue.close().await?;
        return Ok(());
    }

    queue.start_consumers(
        cancel.clone(),
        workers.max(1),
        Arc::new(handlers::registry(args.run.simulate_delay())),
    );

    // Deadline plus cancel grace plus some slack for pickup.
    let limit = config.memory.limits.max_job_duration.max(config.redis.limits.max_job_duration)
        + Duration::from_secs(5);
    let finished = wait_for_terminal(&queue, id, limit).await;
    queue.close().await?;

    let job = finished.with_context(|| format!("job {id} did not finish within {}s", limit.as_secs()))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn wait_for_terminal(queue: &Queue, id: JobId, limit: Duration) -> Option<Job> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(job) = queue.status(id).filter(|j| j.status.is_terminal()) {
            return Some(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn pending(config: &QueueConfig) -> anyhow::Result<()> {
    let queue = open(config).await?;
    println!("{}", queue.len().await);
    queue.close().await?;
    Ok(())
}

async fn dead_letter(config: &QueueConfig, action: DeadLetterCommand) -> anyhow::Result<()> {
    let queue = open(config).await?;
    let Some(redis) = queue.as_redis() else {
        bail!("dead-letter commands need the redis backend (got {})", queue.backend());
    };

    run_dead_letter(redis, action).await?;
    queue.close().await?;
    Ok(())
}

async fn run_dead_letter(queue: &RedisStreamsQueue, action: DeadLetterCommand) -> anyhow::Result<()> {
    match action {
        DeadLetterCommand::Count => {
            println!("{}", queue.dead_letter_count().await?);
        }
        DeadLetterCommand::List { limit } => {
            for entry in queue.dead_letters(limit).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        DeadLetterCommand::Requeue { entry_id } => {
            let message_id = queue
                .requeue_dead_letter(&entry_id)
                .await
                .with_context(|| format!("failed to requeue {entry_id}"))?;
            println!("{message_id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::JobStatus;
    use jobrelay_queue::MemoryQueueConfig;

    #[tokio::test]
    async fn waiting_enqueue_runs_job_in_process() {
        let config = QueueConfig::memory(MemoryQueueConfig::new(8, Duration::from_secs(1)));
        let queue = open(&config).await.unwrap();
        queue.start_consumers(
            CancellationToken::new(),
            1,
            Arc::new(handlers::registry(Duration::from_millis(5))),
        );

        let id = queue
            .enqueue(&CancellationToken::new(), Job::new(handlers::EKG_ANALYZE, b"{}".to_vec()))
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_enqueue_rejects_memory_backend() {
        let args = EnqueueArgs {
            job_type: handlers::EKG_ANALYZE.to_string(),
            payload: "{}".to_string(),
            wait: false,
            run: RunArgs::default(),
        };

        let err = enqueue(&QueueConfig::default(), 1, &args).await.unwrap_err();
        assert!(err.to_string().contains("--wait"), "{err}");
    }

    #[tokio::test]
    async fn waiting_enqueue_on_memory_backend_prints_finished_job() {
        let config = QueueConfig::memory(MemoryQueueConfig::new(8, Duration::from_secs(1)));
        let args = EnqueueArgs {
            job_type: handlers::GPT_PROCESS.to_string(),
            payload: "{}".to_string(),
            wait: true,
            run: RunArgs { simulate_delay_ms: 5 },
        };

        enqueue(&config, 1, &args).await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_commands_reject_memory_backend() {
        let err = dead_letter(&QueueConfig::default(), DeadLetterCommand::Count)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("redis backend"), "{err}");
    }
}
