use thiserror::Error;

/// Errors raised by the event fabric.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker did not acknowledge in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The broker refused a message for a non-retryable reason.
    #[error("Publish to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// A mandatory header was absent from an inbound message.
    #[error("Missing '{0}' header")]
    MissingHeader(&'static str),

    /// A header was present but could not be parsed.
    #[error("Invalid '{header}' header: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },

    /// Joining a consumer group or reading from it failed.
    #[error("Subscription error: {0}")]
    Subscribe(String),

    /// A message handler reported a failure.
    #[error("Handler failed: {message}")]
    Handler { message: String, transient: bool },

    /// A message handler panicked.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

impl MessagingError {
    /// Wraps a handler failure, recording whether redelivery may help.
    pub fn handler(err: impl std::fmt::Display, transient: bool) -> Self {
        MessagingError::Handler {
            message: err.to_string(),
            transient,
        }
    }

    /// Returns true for transient I/O failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::BrokerUnavailable(_)
                | MessagingError::Timeout(_)
                | MessagingError::Handler {
                    transient: true,
                    ..
                }
        )
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
