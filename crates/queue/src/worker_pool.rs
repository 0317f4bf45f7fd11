//! Background task supervision shared by both backends.

use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Tokens handed to the loops of one `start_consumers` call.
#[derive(Debug, Clone)]
pub struct ConsumerTokens {
    /// Loops stop pulling new work once this fires.
    pub stop: CancellationToken,
    /// Parent of every handler context; fires on caller shutdown or after
    /// the close grace period.
    pub root: CancellationToken,
}

/// Tracks the consumer loops of a backend and shuts them down in bounded time.
///
/// - `start` succeeds once per pool
/// - `close` stops new dequeues immediately, lets in-flight jobs finish for a
///   grace period, then cancels their contexts
#[derive(Debug, Default)]
pub struct WorkerPool {
    started: AtomicBool,
    closing: AtomicBool,
    closed: CancellationToken,
    tokens: OnceLock<ConsumerTokens>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to start consumers.
    ///
    /// Returns `None` if consumers were already started or the pool is closed.
    pub fn start(&self, shutdown: &CancellationToken) -> Option<ConsumerTokens> {
        if self.is_closing() {
            warn!("start_consumers called on a closed queue; ignoring");
            return None;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("start_consumers called more than once; ignoring");
            return None;
        }

        let root = shutdown.child_token();
        let tokens = ConsumerTokens {
            stop: root.child_token(),
            root,
        };
        let _ = self.tokens.set(tokens.clone());
        Some(tokens)
    }

    /// Spawn a tracked task. Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has begun.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of live tracked tasks.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop all loops and wait for them.
    ///
    /// Returns `false` if some task had to be abandoned after both grace
    /// periods elapsed.
    pub async fn close(&self, grace: Duration) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return true;
        }

        self.closed.cancel();
        self.tracker.close();
        let Some(tokens) = self.tokens.get() else {
            return true;
        };

        tokens.stop.cancel();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("all consumers stopped");
            return true;
        }

        warn!(grace_ms = grace.as_millis() as u64, "consumers still busy after grace period; cancelling in-flight jobs");
        tokens.root.cancel();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(remaining = self.tracker.len(), "abandoning consumers that did not stop");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn start_is_effective_once() {
        let pool = WorkerPool::new();
        let shutdown = CancellationToken::new();

        assert!(pool.start(&shutdown).is_some());
        assert!(pool.start(&shutdown).is_none());
        assert!(pool.is_started());
    }

    #[tokio::test]
    async fn start_after_close_is_refused() {
        let pool = WorkerPool::new();
        assert!(pool.close(Duration::from_millis(10)).await);
        assert!(pool.start(&CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiters_on_closed() {
        let pool = Arc::new(WorkerPool::new());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.closed().await })
        };

        assert!(pool.close(Duration::from_millis(10)).await);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve once close starts")
            .unwrap();
    }

    #[tokio::test]
    async fn caller_shutdown_reaches_both_tokens() {
        let pool = WorkerPool::new();
        let shutdown = CancellationToken::new();
        let tokens = pool.start(&shutdown).unwrap();

        shutdown.cancel();

        assert!(tokens.stop.is_cancelled());
        assert!(tokens.root.is_cancelled());
    }

    #[tokio::test]
    async fn close_waits_for_loops_then_cancels_stragglers() {
        let pool = WorkerPool::new();
        let tokens = pool.start(&CancellationToken::new()).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        // Well-behaved loop: exits on stop.
        let stop = tokens.stop.clone();
        let done = finished.clone();
        pool.spawn(async move {
            stop.cancelled().await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        // In-flight job: only exits when its context (root) is cancelled.
        let root = tokens.root.clone();
        let done = finished.clone();
        pool.spawn(async move {
            root.cancelled().await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.close(Duration::from_millis(20)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
    }
}
