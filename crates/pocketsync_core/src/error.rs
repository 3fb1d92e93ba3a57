//! Error types for the sync core.

use pocketsync_protocol::ErrorCode;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the sync core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Append attempted on a closed change log.
    #[error("change log is closed")]
    LogClosed,

    /// A caller tried to force a sequence at or below the current one.
    #[error("sequence conflict in {collection}: current {current}, attempted {attempted}")]
    SequenceConflict {
        /// Collection the regression was attempted in.
        collection: String,
        /// The log's current sequence.
        current: u64,
        /// The sequence the caller supplied.
        attempted: u64,
    },

    /// The principal exceeded its connection limit.
    #[error("too many connections for user (max {max})")]
    TooManyConnections {
        /// The configured per-user cap.
        max: usize,
    },

    /// The client exceeded its subscription cap.
    #[error("subscription limit exceeded (max {max})")]
    SubscriptionLimit {
        /// The configured per-client cap.
        max: usize,
    },

    /// No subscription with the given id.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// No client with the given id.
    #[error("unknown client: {0}")]
    UnknownClient(String),
}

impl CoreError {
    /// Maps this error to its wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::LogClosed => ErrorCode::LogClosed,
            CoreError::SequenceConflict { .. } => ErrorCode::SequenceConflict,
            CoreError::TooManyConnections { .. } => ErrorCode::TooManyConnections,
            CoreError::SubscriptionLimit { .. } => ErrorCode::SubscriptionLimit,
            CoreError::UnknownSubscription(_) | CoreError::UnknownClient(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_mapping() {
        assert_eq!(CoreError::LogClosed.code(), ErrorCode::LogClosed);
        assert_eq!(
            CoreError::SubscriptionLimit { max: 4 }.code(),
            ErrorCode::SubscriptionLimit
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = CoreError::SequenceConflict {
            collection: "todos".into(),
            current: 9,
            attempted: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("todos"));
        assert!(msg.contains('9'));
        assert!(msg.contains('3'));
    }
}
