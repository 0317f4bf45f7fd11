//! The job record and its status lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::JobId;

/// Job type tag used by handlers for routing.
///
/// Opaque to the queue; only handlers attach meaning to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by a backend, waiting for a worker
    Queued,
    /// Handed to a handler
    Running,
    /// Handler returned success
    Succeeded,
    /// Handler returned an error, was cancelled, or overran its deadline
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A unit of work.
///
/// Serialized as JSON on the durable stream; the payload travels as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID (nil until assigned)
    pub id: JobId,
    /// Routing tag for handlers
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Opaque payload owned by the handler
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub status: JobStatus,
    /// Failure description, only present when `status == Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create an unsubmitted job with no identifier.
    pub fn new(job_type: impl Into<JobType>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: JobId::nil(),
            job_type: job_type.into(),
            payload: payload.into(),
            status: JobStatus::Queued,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Use a producer-chosen identifier.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Assign an identifier if none was given and reset to `queued`.
    ///
    /// Returns the (possibly new) identifier.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> JobId {
        if self.id.is_nil() {
            self.id = JobId::new();
        }
        self.status = JobStatus::Queued;
        self.error = None;
        self.enqueued_at = now;
        self.started_at = None;
        self.finished_at = None;
        self.id
    }

    /// Mark the job as picked up by a worker.
    ///
    /// `started_at` is only stamped once and never precedes `enqueued_at`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now.max(self.enqueued_at));
        }
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.error = None;
        self.stamp_finished(now);
    }

    /// Mark the job as failed. An empty error text is replaced so a failed
    /// job always explains itself.
    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        let error = error.into();
        self.status = JobStatus::Failed;
        self.error = Some(if error.trim().is_empty() {
            "job failed".to_string()
        } else {
            error
        });
        self.stamp_finished(now);
    }

    fn stamp_finished(&mut self, now: DateTime<Utc>) {
        if self.finished_at.is_some() {
            return;
        }
        let floor = self.started_at.unwrap_or(self.enqueued_at);
        self.finished_at = Some(now.max(floor));
    }

    /// Wall-clock time between start and finish, once both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }

    /// Encode the record as the JSON blob carried on the stream.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Encode(e.to_string()))
    }

    /// Decode a record previously produced by [`Job::to_json`].
    pub fn from_json(data: &str) -> CoreResult<Self> {
        serde_json::from_str(data).map_err(|e| CoreError::decode(e.to_string()))
    }
}

mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
