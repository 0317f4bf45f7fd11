//! Dead-letter stream inspection and manual requeue.

use chrono::{DateTime, Utc};
use redis::streams::{StreamId, StreamRangeReply};
use serde::Serialize;
use tracing::{info, instrument, warn};

use jobrelay_core::Job;
use jobrelay_queue::QueueError;

use super::{FIELD_DATA, FIELD_ID, RedisStreamsQueue, command_error};

/// An entry of the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    /// Id of this entry in the dead-letter stream
    pub entry_id: String,
    /// Id the job had in the main stream
    pub original_id: String,
    pub job_id: Option<String>,
    /// JSON job record, verbatim
    pub data: String,
    pub reason: String,
    pub moved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub(super) fn from_stream(entry: &StreamId) -> Self {
        let field = |name: &str| entry.get::<String>(name);

        Self {
            entry_id: entry.id.clone(),
            original_id: field("original_id").unwrap_or_default(),
            job_id: field(FIELD_ID).filter(|id| !id.is_empty()),
            data: field(FIELD_DATA).unwrap_or_default(),
            reason: field("reason").unwrap_or_default(),
            moved_at: field("moved_at")
                .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        }
    }

    /// Decode the job record carried by this entry.
    pub fn job(&self) -> Result<Job, QueueError> {
        if self.data.is_empty() {
            return Err(QueueError::InvalidMessage(format!(
                "dead-letter entry {} has no job data",
                self.entry_id
            )));
        }
        Ok(Job::from_json(&self.data)?)
    }
}

impl RedisStreamsQueue {
    /// Number of entries in the dead-letter stream.
    #[instrument(skip(self), fields(dead_letter_stream = %self.inner.dead_letter_stream), err)]
    pub async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.inner.conn();
        let count: u64 = redis::cmd("XLEN")
            .arg(&self.inner.dead_letter_stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XLEN", e))?;
        Ok(count)
    }

    /// Oldest dead-lettered entries, up to `limit`.
    #[instrument(skip(self), fields(dead_letter_stream = %self.inner.dead_letter_stream), err)]
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.inner.conn();
        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.inner.dead_letter_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XRANGE", e))?;

        Ok(range.ids.iter().map(DeadLetterEntry::from_stream).collect())
    }

    /// Put a dead-lettered job back on the main stream.
    ///
    /// The job goes through the consumers again with a fresh delivery count.
    /// Returns the new main-stream entry id.
    #[instrument(skip(self), fields(dead_letter_stream = %self.inner.dead_letter_stream), err)]
    pub async fn requeue_dead_letter(&self, entry_id: &str) -> Result<String, QueueError> {
        let mut conn = self.inner.conn();

        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.inner.dead_letter_stream)
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XRANGE", e))?;

        let entry = range
            .ids
            .first()
            .map(DeadLetterEntry::from_stream)
            .ok_or_else(|| QueueError::NotFound(format!("dead-letter entry {entry_id}")))?;

        let job_id = match &entry.job_id {
            Some(id) if !entry.data.is_empty() => id.clone(),
            _ => entry.job()?.id.to_string(),
        };

        let new_id: String = redis::cmd("XADD")
            .arg(&self.inner.config.stream)
            .arg("*")
            .arg(FIELD_ID)
            .arg(&job_id)
            .arg(FIELD_DATA)
            .arg(&entry.data)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XADD", e))?;

        // The job is already back on the main stream; a leftover copy in the
        // sink is only cosmetic.
        let deleted: redis::RedisResult<u64> = redis::cmd("XDEL")
            .arg(&self.inner.dead_letter_stream)
            .arg(entry_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = deleted {
            warn!(entry_id, error = %e, "XDEL from dead-letter stream failed");
        }

        info!(job_id = %job_id, entry_id, message_id = %new_id, "dead-lettered job requeued");
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000001-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn parses_all_fields() {
        let entry = DeadLetterEntry::from_stream(&stream_entry(&[
            ("original_id", "1699999999999-0"),
            ("id", "0190c7b6-0000-7000-8000-000000000001"),
            ("data", "{}"),
            ("reason", "exceeded max retries (3): delivered 4 times"),
            ("moved_at", "2024-05-01T10:00:00+00:00"),
        ]));

        assert_eq!(entry.entry_id, "1700000000001-0");
        assert_eq!(entry.original_id, "1699999999999-0");
        assert_eq!(entry.job_id.as_deref(), Some("0190c7b6-0000-7000-8000-000000000001"));
        assert!(entry.reason.starts_with("exceeded max retries"));
        assert_eq!(entry.moved_at.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn tolerates_missing_fields() {
        let entry = DeadLetterEntry::from_stream(&stream_entry(&[("moved_at", "yesterday")]));

        assert!(entry.job_id.is_none());
        assert!(entry.moved_at.is_none());
        assert!(matches!(entry.job(), Err(QueueError::InvalidMessage(_))));
    }

    #[test]
    fn job_decodes_data() {
        let mut job = Job::new("gpt_process", b"hello".to_vec());
        job.mark_queued(Utc::now());
        let data = job.to_json().unwrap();

        let entry = DeadLetterEntry::from_stream(&stream_entry(&[("data", data.as_str())]));

        assert_eq!(entry.job().unwrap(), job);
    }
}
