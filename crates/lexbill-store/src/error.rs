//! Error types for lexbill storage.

use lexbill_core::BillingError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// A unique key is already taken.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// A conditional write found a different current value.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::ConcurrentModification(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
