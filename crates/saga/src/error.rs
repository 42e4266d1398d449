//! Saga error types.

use common::TransactionId;
use messaging::MessagingError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga definition is malformed and never enters the store.
    #[error("Invalid saga: {0}")]
    Validation(String),

    /// No saga with this id exists for the tenant.
    #[error("Saga not found: {0}")]
    NotFound(TransactionId),

    /// Writers kept racing on the same saga row.
    #[error("Saga {0} kept changing underneath the engine")]
    Contended(TransactionId),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Messaging error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Contended(_) => true,
            SagaError::Store(e) => e.is_transient(),
            SagaError::Messaging(e) => e.is_transient(),
            SagaError::Validation(_) | SagaError::NotFound(_) | SagaError::Serialization(_) => {
                false
            }
        }
    }
}

impl From<SagaError> for MessagingError {
    fn from(err: SagaError) -> Self {
        let transient = err.is_transient();
        MessagingError::handler(err, transient)
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SagaError::Contended(TransactionId::new()).is_transient());
        assert!(
            SagaError::Messaging(MessagingError::BrokerUnavailable("down".into())).is_transient()
        );
        assert!(!SagaError::Validation("no steps".into()).is_transient());
    }

    #[test]
    fn converts_to_handler_error_keeping_transience() {
        let err: MessagingError = SagaError::Contended(TransactionId::new()).into();
        assert!(err.is_transient());
        let err: MessagingError = SagaError::Validation("bad".into()).into();
        assert!(!err.is_transient());
    }
}
