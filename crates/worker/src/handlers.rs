//! Stand-in handlers for the job types the dispatcher carries.
//!
//! The real EKG analysis and GPT post-processing live in other services;
//! these only take the configured time and honour cancellation, which is
//! enough to exercise deadlines, reclaims and shutdown end to end.

use std::time::Duration;

use tracing::debug;

use jobrelay_core::Job;
use jobrelay_queue::{HandlerRegistry, HandlerResult, JobContext, JobHandler};

pub const EKG_ANALYZE: &str = "ekg_analyze";
pub const GPT_PROCESS: &str = "gpt_process";

/// A handler that succeeds after `delay` unless its context is cancelled first.
pub fn simulated(delay: Duration) -> impl JobHandler {
    move |ctx: JobContext, job: Job| async move { simulate(ctx, job, delay).await }
}

async fn simulate(ctx: JobContext, job: Job, delay: Duration) -> HandlerResult {
    debug!(job_id = %job.id, job_type = %job.job_type, delay_ms = delay.as_millis() as u64, "simulating work");

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = ctx.cancelled() => Err(anyhow::anyhow!("job timeout/canceled")),
    }
}

/// Registry routing the known job types to simulated handlers.
pub fn registry(delay: Duration) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(EKG_ANALYZE, simulated(delay))
        .with(GPT_PROCESS, simulated(delay))
}
