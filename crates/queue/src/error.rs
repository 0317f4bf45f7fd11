//! Dispatcher error model.

use jobrelay_core::CoreError;

/// Errors surfaced by [`crate::JobQueue`] operations.
///
/// Handler failures never appear here; they are recorded on the job itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The caller's cancellation fired before the job was accepted.
    #[error("enqueue cancelled before the job was accepted")]
    Cancelled,

    /// The queue was closed and no longer accepts work.
    #[error("queue is closed")]
    Closed,

    /// The bounded buffer has no room (non-blocking submission only).
    #[error("queue buffer is full")]
    Full,

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The broker rejected a command or could not be reached.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stored message does not have the expected shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl QueueError {
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }
}

impl From<CoreError> for QueueError {
    fn from(value: CoreError) -> Self {
        Self::Serialization(value.to_string())
    }
}
