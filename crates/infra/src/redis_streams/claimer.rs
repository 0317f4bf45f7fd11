//! Reclaims entries whose consumer died before acknowledging them.
//!
//! Every `claim_interval` the pending list is scanned. Entries idle for at
//! least `claim_idle_timeout` are transferred to the claimer identity, then
//! either re-dispatched or, once delivered more than `max_retries` times,
//! moved to the dead-letter stream.

use std::sync::Arc;

use chrono::Utc;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use jobrelay_queue::{ConsumerTokens, QueueError, SharedHandler};

use super::{FIELD_DATA, FIELD_ID, Inner, command_error};

/// Outcome of one claimer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimReport {
    /// Entries handed back to the handler
    pub reclaimed: usize,
    /// Entries moved to the dead-letter stream
    pub dead_lettered: usize,
}

impl ClaimReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed == 0 && self.dead_lettered == 0
    }
}

/// Whether an entry delivered `deliveries` times has used up its retries.
pub(super) fn exceeds_retry_ceiling(deliveries: u64, max_retries: u64) -> bool {
    deliveries > max_retries
}

impl Inner {
    pub(super) fn remember_claim_context(&self, tokens: &ConsumerTokens, handler: &SharedHandler) {
        let _ = self.claim_ctx.set((tokens.clone(), handler.clone()));
    }

    pub(super) fn claim_context(&self) -> Option<(ConsumerTokens, SharedHandler)> {
        self.claim_ctx.get().cloned()
    }

    pub(super) async fn claim_loop(self: Arc<Self>, tokens: ConsumerTokens, handler: SharedHandler) {
        let period = self.config.claim_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(interval_ms = period.as_millis() as u64, "claimer started");

        loop {
            tokio::select! {
                biased;
                _ = tokens.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.claim_stuck(&tokens, &handler).await {
                Ok(report) if !report.is_empty() => info!(
                    reclaimed = report.reclaimed,
                    dead_lettered = report.dead_lettered,
                    "claimer pass finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "claimer pass failed"),
            }
        }

        debug!("claimer stopped");
    }

    /// One scan of the pending list.
    pub(super) async fn claim_stuck(
        self: &Arc<Self>,
        tokens: &ConsumerTokens,
        handler: &SharedHandler,
    ) -> Result<ClaimReport, QueueError> {
        let idle_ms = self.config.claim_idle_timeout.as_millis() as u64;
        let mut conn = self.conn();

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("-")
            .arg("+")
            .arg(self.config.claim_batch)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XPENDING", e))?;

        let mut report = ClaimReport::default();

        for stuck in pending.ids.into_iter().filter(|p| p.last_delivered_ms as u64 >= idle_ms) {
            if tokens.stop.is_cancelled() {
                break;
            }

            // XCLAIM re-checks the idle time, so an entry acked or claimed by
            // someone else since the scan comes back empty.
            let claimed: redis::RedisResult<StreamClaimReply> = redis::cmd("XCLAIM")
                .arg(&self.config.stream)
                .arg(&self.config.group)
                .arg(&self.config.claimer_name)
                .arg(idle_ms)
                .arg(&stuck.id)
                .query_async(&mut conn)
                .await;

            let claimed = match claimed {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(message_id = %stuck.id, error = %e, "XCLAIM failed");
                    continue;
                }
            };

            let deliveries = stuck.times_delivered as u64;

            for entry in claimed.ids {
                if exceeds_retry_ceiling(deliveries, self.config.max_retries) {
                    let reason = format!(
                        "exceeded max retries ({}): delivered {} times, last consumer {}",
                        self.config.max_retries, deliveries, stuck.consumer
                    );
                    match self.move_to_dead_letter(&entry, &reason).await {
                        Ok(_) => report.dead_lettered += 1,
                        Err(e) => error!(message_id = %entry.id, error = %e, "failed to dead-letter entry"),
                    }
                    continue;
                }

                debug!(
                    message_id = %entry.id,
                    previous_consumer = %stuck.consumer,
                    deliveries,
                    "reclaimed stuck entry"
                );
                report.reclaimed += 1;

                let inner = Arc::clone(self);
                let handler = handler.clone();
                let root = tokens.root.clone();
                self.pool.spawn(async move {
                    let worker = inner.config.claimer_name.clone();
                    inner.process_entry(entry, handler.as_ref(), &root, &worker).await;
                });
            }
        }

        Ok(report)
    }

    /// Copy an entry to the dead-letter stream, then ack it out of the group.
    ///
    /// Returns the dead-letter entry id.
    #[instrument(skip(self, entry), fields(message_id = %entry.id, dead_letter_stream = %self.dead_letter_stream), err)]
    pub(super) async fn move_to_dead_letter(&self, entry: &StreamId, reason: &str) -> Result<String, QueueError> {
        let job_id: String = entry.get(FIELD_ID).unwrap_or_default();
        let data: String = entry.get(FIELD_DATA).unwrap_or_default();
        let mut conn = self.conn();

        let dead_letter_id: String = redis::cmd("XADD")
            .arg(&self.dead_letter_stream)
            .arg("*")
            .arg("original_id")
            .arg(&entry.id)
            .arg(FIELD_ID)
            .arg(&job_id)
            .arg(FIELD_DATA)
            .arg(&data)
            .arg("reason")
            .arg(reason)
            .arg("moved_at")
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("dead-letter XADD", e))?;

        if !self.ack(&entry.id).await {
            // Left pending, the entry would be dead-lettered again on the
            // next pass. Drop the copy so that pass starts clean.
            let removed: redis::RedisResult<u64> = redis::cmd("XDEL")
                .arg(&self.dead_letter_stream)
                .arg(&dead_letter_id)
                .query_async(&mut conn)
                .await;
            if let Err(e) = removed {
                error!(dead_letter_id = %dead_letter_id, error = %e, "failed to roll back dead-letter copy");
            }
            return Err(QueueError::broker(format!(
                "XACK of {} failed after dead-lettering",
                entry.id
            )));
        }

        warn!(
            job_id = %job_id,
            dead_letter_id = %dead_letter_id,
            reason,
            "entry moved to dead-letter stream"
        );

        Ok(dead_letter_id)
    }
}
