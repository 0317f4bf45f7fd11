//! Handler contract and type-based routing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use jobrelay_core::Job;

/// What a handler returns. Any error marks the job `failed`.
pub type HandlerResult = anyhow::Result<()>;

/// Handler shared between all workers of a backend.
pub type SharedHandler = Arc<dyn JobHandler>;

/// Execution context passed to every handler invocation.
///
/// The token is cancelled when the per-job deadline elapses or the consumers
/// are shut down, whichever comes first. Handlers should treat cancellation
/// as a request to stop and return promptly.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: Instant,
}

impl JobContext {
    pub fn new(token: CancellationToken, deadline: Instant) -> Self {
        Self { token, deadline }
    }

    /// Resolves once the invocation has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The underlying token, for handing to nested work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A unit-of-work executor supplied by the application.
///
/// Implemented for any `Fn(JobContext, Job) -> impl Future<Output = HandlerResult>`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: Job) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: JobContext, job: Job) -> HandlerResult {
        (self)(ctx, job).await
    }
}

/// Routes jobs to handlers by their type tag.
///
/// Lookup order: exact match, then the longest `prefix.*` pattern, then `*`.
/// Jobs with no matching handler fail with an "unknown job type" error.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, SharedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type pattern.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    /// Builder-style [`HandlerRegistry::register`].
    pub fn with<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find the handler for a job type.
    pub fn resolve(&self, job_type: &str) -> Option<&SharedHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, ctx: JobContext, job: Job) -> HandlerResult {
        match self.resolve(job.job_type.as_str()) {
            Some(handler) => handler.handle(ctx, job).await,
            None => Err(anyhow::anyhow!("unknown job type: {}", job.job_type)),
        }
    }
}
