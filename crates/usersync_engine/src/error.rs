//! Error types for the sync engine.

use crate::files::FileError;
use thiserror::Error;
use usersync_protocol::{ProtocolError, SyncResource};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote or persisted data that this engine version cannot process.
    #[error("incompatible {resource} data: {message}")]
    Incompatible {
        /// Resource the data belongs to.
        resource: SyncResource,
        /// What made the data incompatible.
        message: String,
    },

    /// The remote store rejected a conditional write because the ref moved.
    #[error("remote precondition failed")]
    PreconditionFailed,

    /// The local file changed between snapshot and commit.
    #[error("local precondition failed")]
    LocalPreconditionFailed,

    /// The precondition-retry loop exceeded its safety cap.
    #[error("sync gave up after {attempts} precondition retries")]
    TooManyRetries {
        /// Number of retries attempted.
        attempts: u32,
    },

    /// Network or remote-store transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Local file service error.
    #[error("file error: {0}")]
    File(#[from] FileError),

    /// Protocol data could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Synchronization of the resource is disabled.
    #[error("synchronizing {0} is disabled")]
    Disabled(SyncResource),

    /// The operation was cancelled via `stop`.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates an incompatibility error for a version the engine does not
    /// support.
    pub fn incompatible_version(resource: SyncResource, found: u32, supported: u32) -> Self {
        Self::Incompatible {
            resource,
            message: format!("version {found} is newer than supported version {supported}"),
        }
    }

    /// Creates an incompatibility error for an unrecognizable payload.
    pub fn incompatible_payload(resource: SyncResource, message: impl Into<String>) -> Self {
        Self::Incompatible {
            resource,
            message: message.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true for the two precondition failures the engine recovers
    /// from internally.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::PreconditionFailed | SyncError::LocalPreconditionFailed
        )
    }

    /// Returns true if the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::PreconditionFailed | SyncError::LocalPreconditionFailed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_predicates() {
        assert!(SyncError::PreconditionFailed.is_precondition());
        assert!(SyncError::LocalPreconditionFailed.is_precondition());
        assert!(!SyncError::Cancelled.is_precondition());
        assert!(!SyncError::TooManyRetries { attempts: 8 }.is_precondition());
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::incompatible_version(SyncResource::Settings, 9, 1).is_retryable());
    }

    #[test]
    fn incompatible_display_names_resource() {
        let err = SyncError::incompatible_version(SyncResource::Keybindings, 4, 2);
        let text = err.to_string();
        assert!(text.contains("keybindings"));
        assert!(text.contains('4'));
    }
}
