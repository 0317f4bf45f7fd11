//! Error model for the job record.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures parsing or decoding job records.
///
/// Lifecycle transitions themselves are infallible; these errors only come
/// from text and wire input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier failed to parse.
    #[error("invalid job id: {0}")]
    InvalidId(String),

    /// A status string is not one of the known lifecycle states.
    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    /// The serialized job record could not be decoded.
    #[error("malformed job record: {0}")]
    Decode(String),

    /// The job record could not be encoded.
    #[error("failed to encode job record: {0}")]
    Encode(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}
