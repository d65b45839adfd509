//! Error types for the sync layer.

use crate::operation::OperationId;
use stowage_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while saving or querying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Error from the local object model (not found, version conflict,
    /// validation).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Remote failure that may succeed if tried again.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// Transient failures continued until the attempt limit was reached.
    #[error("remote error after {attempts} attempts: {message}")]
    TerminalRemote {
        /// Number of attempts made.
        attempts: u32,
        /// Message of the last failure.
        message: String,
    },

    /// The remote refused the request; retrying will not help.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The remote did not accept the configured credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The operation was cancelled before it was dispatched.
    #[error("operation cancelled")]
    Cancelled,

    /// No live operation has this id.
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// The operation has already been dispatched.
    #[error("operation {0} is in flight and cannot be cancelled")]
    NotCancellable(OperationId),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The queue has been shut down.
    #[error("sync queue is closed")]
    QueueClosed,

    /// No async runtime is available to run the operation.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientRemote(_) | SyncError::Timeout)
    }

    /// Converts the last transient failure into the error reported once
    /// the attempt limit is reached. Non-retryable errors pass through.
    pub fn exhausted(self, attempts: u32) -> Self {
        if self.is_retryable() {
            SyncError::TerminalRemote {
                attempts,
                message: self.to_string(),
            }
        } else {
            self
        }
    }
}
