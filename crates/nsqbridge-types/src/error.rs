//! Error types for NsqBridge
//!
//! Defines all error types used throughout the engine.

use thiserror::Error;

use crate::outcome::ConnectionFailure;

/// Boxed error returned by application handlers and broker backends
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for NsqBridge operations
#[derive(Error, Debug)]
pub enum Error {
    /// The connection pool has been closed
    #[error("Pool closed")]
    PoolClosed,

    /// No broker connection is available for a publish
    #[error("No connection available for topic: {0}")]
    NoConnection(String),

    /// Every targeted connection failed
    #[error("Publish to topic {topic} failed on all {} connection(s)", .failures.len())]
    PublishFailed {
        topic: String,
        failures: Vec<ConnectionFailure>,
    },

    /// Unsupported binding kind or operation
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A binding for the same topic and channel already exists
    #[error("Duplicate binding: {topic}/{channel}")]
    DuplicateBinding { topic: String, channel: String },

    /// The server was started twice
    #[error("Server already started")]
    AlreadyStarted,

    /// A message received a second finish/requeue
    #[error("Message already acknowledged: {0}")]
    AlreadyAcknowledged(String),

    /// Broker connection error
    #[error("Connection error ({address}): {reason}")]
    Connection { address: String, reason: String },

    /// Directory service error
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a connection error for the given broker address
    pub fn connection(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for NsqBridge operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_failed_message_counts_failures() {
        let err = Error::PublishFailed {
            topic: "orders".to_string(),
            failures: vec![
                ConnectionFailure::new("nsqd-a:4150", "refused"),
                ConnectionFailure::new("nsqd-b:4150", "timeout"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Publish to topic orders failed on all 2 connection(s)"
        );
    }
}
