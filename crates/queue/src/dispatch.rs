//! Per-job execution: deadline, cancellation, and status bookkeeping.
//!
//! Both backends funnel every dequeued job through [`process_job`], so the
//! lifecycle rules live in exactly one place:
//!
//! - `running` + `started_at` before the handler is invoked
//! - the handler races its deadline; at the deadline its token is cancelled
//!   and it gets a short grace period to return before being abandoned
//! - any error, panic, or post-cancellation return marks the job `failed`

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use jobrelay_core::{Job, JobStatus};

use crate::handler::{JobContext, JobHandler};
use crate::status_cache::StatusCache;

/// Time bounds applied to each handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Deadline after which the handler's context is cancelled
    pub max_job_duration: Duration,
    /// How long a cancelled handler may take to return before it is abandoned
    pub cancel_grace: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_job_duration: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(1),
        }
    }
}

impl ExecutionLimits {
    pub fn new(max_job_duration: Duration) -> Self {
        Self {
            max_job_duration,
            ..Default::default()
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Why an invocation stopped before the handler finished on its own.
#[derive(Debug, Clone, Copy)]
enum Interruption {
    Deadline(Duration),
    Shutdown,
}

impl Interruption {
    fn describe(self) -> String {
        match self {
            Interruption::Deadline(limit) => {
                format!("job exceeded maximum duration of {}ms", limit.as_millis())
            }
            Interruption::Shutdown => "job cancelled by shutdown".to_string(),
        }
    }
}

/// Invoke `handler` for `job` under a context derived from `parent`.
///
/// Returns the failure text on any unsuccessful outcome.
pub async fn execute(
    handler: &dyn JobHandler,
    parent: &CancellationToken,
    limits: ExecutionLimits,
    job: Job,
) -> Result<(), String> {
    let token = parent.child_token();
    let deadline = Instant::now() + limits.max_job_duration;
    let ctx = JobContext::new(token.clone(), deadline);

    let mut invocation = AssertUnwindSafe(handler.handle(ctx, job)).catch_unwind();

    let interruption = tokio::select! {
        biased;
        result = &mut invocation => return settle(result),
        _ = tokio::time::sleep_until(deadline) => Interruption::Deadline(limits.max_job_duration),
        _ = token.cancelled() => Interruption::Shutdown,
    };

    token.cancel();

    match tokio::time::timeout(limits.cancel_grace, &mut invocation).await {
        Ok(result) => match settle(result) {
            Err(reason) => Err(format!("{}: {reason}", interruption.describe())),
            Ok(()) => Err(interruption.describe()),
        },
        Err(_) => Err(format!(
            "{} (handler did not stop within {}ms)",
            interruption.describe(),
            limits.cancel_grace.as_millis()
        )),
    }
}

fn settle(result: Result<anyhow::Result<()>, Box<dyn Any + Send>>) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run one dequeued job to a terminal status, recording each phase in `cache`.
///
/// Returns the final snapshot.
pub async fn process_job(
    handler: &dyn JobHandler,
    parent: &CancellationToken,
    limits: ExecutionLimits,
    cache: &StatusCache,
    mut job: Job,
    worker: &str,
) -> Job {
    job.mark_running(Utc::now());
    cache.insert(job.clone());

    info!(job_id = %job.id, job_type = %job.job_type, worker, "processing job");

    let outcome = execute(handler, parent, limits, job.clone()).await;

    match outcome {
        Ok(()) => {
            job.mark_succeeded(Utc::now());
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                worker,
                duration_ms = job.duration().map(|d| d.num_milliseconds()).unwrap_or_default(),
                "job completed"
            );
        }
        Err(reason) => {
            error!(job_id = %job.id, job_type = %job.job_type, worker, error = %reason, "job failed");
            job.mark_failed(Utc::now(), reason);
        }
    }

    debug_assert!(job.status.is_terminal());
    debug_assert_eq!(job.error.is_some(), job.status == JobStatus::Failed);

    cache.insert(job.clone());
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::handler::HandlerResult;

    fn limits(ms: u64) -> ExecutionLimits {
        ExecutionLimits::new(Duration::from_millis(ms)).with_cancel_grace(Duration::from_millis(50))
    }

    fn queued_job() -> Job {
        let mut job = Job::new("test", br#"{"test":"data1"}"#.to_vec());
        job.mark_queued(Utc::now());
        job
    }

    #[tokio::test]
    async fn successful_handler_marks_succeeded() {
        let cache = StatusCache::new();
        let handler = |_ctx: JobContext, _job: Job| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            anyhow::Ok(())
        };

        let job = process_job(&handler, &CancellationToken::new(), limits(1000), &cache, queued_job(), "w1").await;

        assert_eq!(job.status, JobStatus::Succeeded);
        let started = job.started_at.unwrap();
        let finished = job.finished_at.unwrap();
        assert!(started <= finished);
        assert_eq!(cache.get(job.id).unwrap(), job);
    }

    #[tokio::test]
    async fn failing_handler_records_error_chain() {
        let cache = StatusCache::new();
        let handler = |_ctx: JobContext, _job: Job| async move {
            Err::<(), _>(anyhow::anyhow!("disk full").context("storing result"))
        };

        let job = process_job(&handler, &CancellationToken::new(), limits(1000), &cache, queued_job(), "w1").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("storing result: disk full"));
    }

    #[tokio::test]
    async fn deadline_cancels_context_and_fails_job() {
        let cache = StatusCache::new();
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();
        let handler = move |ctx: JobContext, _job: Job| {
            let flag = flag.clone();
            async move {
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("handler timed out"))
            }
        };

        let job = process_job(&handler, &CancellationToken::new(), limits(20), &cache, queued_job(), "w1").await;

        assert!(saw_cancel.load(Ordering::SeqCst));
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.contains("exceeded maximum duration"), "{error}");
        assert!(error.contains("handler timed out"), "{error}");
    }

    #[tokio::test]
    async fn handler_ignoring_cancellation_is_abandoned() {
        let handler = |_ctx: JobContext, _job: Job| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        };

        let started = std::time::Instant::now();
        let err = execute(&handler, &CancellationToken::new(), limits(20), queued_job())
            .await
            .unwrap_err();

        assert!(err.contains("did not stop"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_and_grace_bound_a_stuck_handler() {
        let handler = |_ctx: JobContext, _job: Job| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::Ok(())
        };

        let start = Instant::now();
        let err = execute(
            &handler,
            &CancellationToken::new(),
            ExecutionLimits::new(Duration::from_secs(30)),
            queued_job(),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            "job exceeded maximum duration of 30000ms (handler did not stop within 1000ms)"
        );
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(31) && waited < Duration::from_secs(32), "{waited:?}");
    }

    #[tokio::test]
    async fn success_after_deadline_still_fails() {
        let handler = |ctx: JobContext, _job: Job| async move {
            ctx.cancelled().await;
            anyhow::Ok(())
        };

        let err = execute(&handler, &CancellationToken::new(), limits(10), queued_job())
            .await
            .unwrap_err();

        assert_eq!(err, "job exceeded maximum duration of 10ms");
    }

    #[tokio::test]
    async fn parent_shutdown_cancels_handler() {
        let parent = CancellationToken::new();
        let handler = |ctx: JobContext, _job: Job| async move {
            ctx.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("stopped"))
        };

        let trigger = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = execute(&handler, &parent, limits(10_000), queued_job())
            .await
            .unwrap_err();

        assert_eq!(err, "job cancelled by shutdown: stopped");
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        async fn explode(_ctx: JobContext, _job: Job) -> HandlerResult {
            panic!("kaboom");
        }

        let err = execute(&explode, &CancellationToken::new(), limits(1000), queued_job())
            .await
            .unwrap_err();

        assert_eq!(err, "handler panicked: kaboom");
    }
}
