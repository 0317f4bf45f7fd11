//! Consumer loops: blocking group reads, dispatch, ack.

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobrelay_core::{Job, JobStatus};
use jobrelay_queue::{ConsumerTokens, JobHandler, QueueError, SharedHandler, process_job};

use super::{FIELD_DATA, Inner};

/// Decode the job record carried by a stream entry.
pub(super) fn decode_entry(entry: &StreamId) -> Result<Job, QueueError> {
    let data: String = entry
        .get(FIELD_DATA)
        .ok_or_else(|| QueueError::InvalidMessage(format!("entry {} has no {FIELD_DATA} field", entry.id)))?;

    Job::from_json(&data).map_err(|e| QueueError::InvalidMessage(format!("entry {}: {e}", entry.id)))
}

/// Whether a processed entry should be acknowledged.
///
/// A job that failed after the consumer root was cancelled was cut short by
/// shutdown, not by its handler, so its entry stays pending.
pub(super) fn should_ack(job: &Job, root: &CancellationToken) -> bool {
    !(job.status == JobStatus::Failed && root.is_cancelled())
}

impl Inner {
    pub(super) async fn consume(self: Arc<Self>, consumer: String, tokens: ConsumerTokens, handler: SharedHandler) {
        debug!(consumer = %consumer, "stream consumer started");

        // Blocking reads get their own connection so they never hold up
        // enqueues and acks on the shared one.
        let mut conn: Option<MultiplexedConnection> = None;

        while !tokens.stop.is_cancelled() {
            if conn.is_none() {
                match self.client.get_multiplexed_async_connection().await {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        error!(consumer = %consumer, error = %e, "failed to open consumer connection");
                        self.backoff(&tokens.stop).await;
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            let read = tokio::select! {
                biased;
                _ = tokens.stop.cancelled() => break,
                read = self.read_next(c, &consumer) => read,
            };

            match read {
                Ok(Some(entry)) => {
                    self.process_entry(entry, handler.as_ref(), &tokens.root, &consumer).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(consumer = %consumer, error = %e, "XREADGROUP failed");
                    if e.code() == Some("NOGROUP") {
                        // Stream or group deleted underneath us.
                        if let Err(e) = self.ensure_group().await {
                            error!(error = %e, "failed to recreate consumer group");
                        }
                    }
                    conn = None;
                    self.backoff(&tokens.stop).await;
                }
            }
        }

        debug!(consumer = %consumer, "stream consumer stopped");
    }

    /// Read at most one new entry for `consumer`, blocking up to `read_block`.
    async fn read_next(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> redis::RedisResult<Option<StreamId>> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.read_block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query_async(conn)
            .await?;

        Ok(reply.and_then(|r| r.keys.into_iter().flat_map(|key| key.ids).next()))
    }

    async fn backoff(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(self.config.error_backoff) => {}
        }
    }

    /// Run one delivered entry to completion and acknowledge it.
    ///
    /// Malformed entries are acked and dropped. A job that failed because the
    /// consumers were shut down is left pending so another process can
    /// reclaim it.
    pub(super) async fn process_entry(
        &self,
        entry: StreamId,
        handler: &dyn JobHandler,
        root: &CancellationToken,
        worker: &str,
    ) {
        let job = match decode_entry(&entry) {
            Ok(job) => job,
            Err(e) => {
                warn!(message_id = %entry.id, worker, error = %e, "dropping malformed stream entry");
                self.ack(&entry.id).await;
                return;
            }
        };

        let job = process_job(handler, root, self.config.limits, &self.cache, job, worker).await;

        if !should_ack(&job, root) {
            info!(
                job_id = %job.id,
                message_id = %entry.id,
                worker,
                "job interrupted by shutdown; leaving entry pending for reclaim"
            );
            return;
        }

        if self.ack(&entry.id).await {
            debug!(job_id = %job.id, message_id = %entry.id, worker, "entry acknowledged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use jobrelay_queue::{ExecutionLimits, JobContext, StatusCache};

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn decodes_job_from_data_field() {
        let mut job = Job::new("ekg_analyze", br#"{"test":"data1"}"#.to_vec());
        let id = job.mark_queued(chrono::Utc::now());
        let data = job.to_json().unwrap();
        let id_field = id.to_string();

        let decoded = decode_entry(&entry(&[("id", id_field.as_str()), ("data", data.as_str())])).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn missing_data_field_is_invalid() {
        let err = decode_entry(&entry(&[("id", "x")])).unwrap_err();
        assert!(matches!(err, QueueError::InvalidMessage(ref m) if m.contains("no data field")), "{err}");
    }

    #[test]
    fn malformed_json_is_invalid() {
        let err = decode_entry(&entry(&[("data", "{not json")])).unwrap_err();
        assert!(matches!(err, QueueError::InvalidMessage(_)), "{err}");
    }

    fn finished(status: JobStatus) -> Job {
        let mut job = Job::new("ekg_analyze", Vec::new());
        job.mark_queued(chrono::Utc::now());
        job.mark_running(chrono::Utc::now());
        match status {
            JobStatus::Succeeded => job.mark_succeeded(chrono::Utc::now()),
            _ => job.mark_failed(chrono::Utc::now(), "boom"),
        }
        job
    }

    #[test]
    fn finished_jobs_are_acked_while_running() {
        let root = CancellationToken::new();

        assert!(should_ack(&finished(JobStatus::Succeeded), &root));
        assert!(should_ack(&finished(JobStatus::Failed), &root));
    }

    #[test]
    fn success_is_acked_even_during_shutdown() {
        let root = CancellationToken::new();
        root.cancel();

        assert!(should_ack(&finished(JobStatus::Succeeded), &root));
    }

    #[tokio::test]
    async fn job_cut_short_by_shutdown_is_left_pending() {
        let root = CancellationToken::new();
        let cache = StatusCache::new();
        let handler = |ctx: JobContext, _job: Job| async move {
            ctx.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("interrupted"))
        };

        let mut job = Job::new("ekg_analyze", Vec::new());
        job.mark_queued(chrono::Utc::now());

        let stop = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop.cancel();
        });

        let limits = ExecutionLimits::new(Duration::from_secs(5)).with_cancel_grace(Duration::from_millis(100));
        let job = process_job(&handler, &root, limits, &cache, job, "worker-1").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(!should_ack(&job, &root));
    }
}
