use thiserror::Error;

use crate::{TransactionId, Version};

/// Errors that can occur when reading or writing saga rows.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row changed since the caller read it.
    #[error(
        "Version conflict for saga {transaction_id}: expected version {expected}, found {actual}"
    )]
    VersionConflict {
        transaction_id: TransactionId,
        expected: Version,
        actual: Version,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value this build does not understand.
    #[error("Invalid saga row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            )
        )
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
