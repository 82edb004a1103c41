//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An envelope did not match one of the recognized shapes.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A persisted last-sync record could not be decoded.
    #[error("malformed last-sync record: {0}")]
    MalformedRecord(String),

    /// A URI is not a valid backup handle.
    #[error("malformed backup handle: {0}")]
    MalformedHandle(String),

    /// A resource name is not one of the known kinds.
    #[error("unknown sync resource: {0}")]
    UnknownResource(String),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates a malformed-envelope error.
    pub fn malformed_envelope(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope(message.into())
    }

    /// Creates a malformed-record error.
    pub fn malformed_record(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }

    /// Creates a malformed-handle error.
    pub fn malformed_handle(message: impl Into<String>) -> Self {
        Self::MalformedHandle(message.into())
    }
}
