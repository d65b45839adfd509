//! Error types for the Stowage core.

use crate::id::{EntityKey, ObjectId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the local object model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// No entity is stored under the key.
    #[error("entity not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: EntityKey,
    },

    /// A version-checked operation saw a different version than expected.
    #[error("version conflict on {key}: expected {expected}, current {actual}")]
    VersionConflict {
        /// The entity key.
        key: EntityKey,
        /// Version supplied by the caller.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A field, class name or value failed validation.
    #[error("invalid {field}: {message}")]
    Validation {
        /// The offending field (or `className`).
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// The remote object id was already assigned to something else.
    #[error("object id of {key} is already {current}, refusing to change it to {attempted}")]
    IdentifierImmutable {
        /// The entity key.
        key: EntityKey,
        /// The id already assigned.
        current: ObjectId,
        /// The id that was rejected.
        attempted: ObjectId,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(key: EntityKey) -> Self {
        Self::NotFound { key }
    }
}
