//! Protocol error types and wire error codes.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("malformed message: {0}")]
    Parse(String),

    /// The envelope named a message type this peer does not know.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required envelope field was missing or had the wrong shape.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Encoding a message to JSON failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Maps this error to the wire error code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Parse(_) | ProtocolError::Encode(_) => ErrorCode::ParseError,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownMessageType,
            ProtocolError::InvalidEnvelope(_) => ErrorCode::ParseError,
        }
    }
}

/// Wire error codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Payload was not valid JSON or the envelope was malformed.
    ParseError,
    /// The message `type` is not part of the protocol.
    UnknownMessageType,
    /// Handshake protocol version not supported.
    VersionMismatch,
    /// Authentication was rejected.
    AuthFailed,
    /// The client exceeded its per-user connection limit.
    TooManyConnections,
    /// The client exceeded its subscription cap.
    SubscriptionLimit,
    /// A request arrived before the handshake completed.
    HandshakeRequired,
    /// A well-formed message the server cannot act on as sent.
    InvalidRequest,
    /// The change log has been closed.
    LogClosed,
    /// A sequence regression was detected in the change log.
    SequenceConflict,
    /// An unexpected server-side failure.
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::TooManyConnections => "TOO_MANY_CONNECTIONS",
            ErrorCode::SubscriptionLimit => "SUBSCRIPTION_LIMIT",
            ErrorCode::HandshakeRequired => "HANDSHAKE_REQUIRED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::LogClosed => "LOG_CLOSED",
            ErrorCode::SequenceConflict => "SEQUENCE_CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether the client may safely retry the failed exchange.
    ///
    /// The sync protocol is idempotent under retry: re-pushing or
    /// re-pulling from an unchanged checkpoint is safe, so internal
    /// failures are marked retryable. Protocol and authorization
    /// failures are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::LogClosed | ErrorCode::SequenceConflict | ErrorCode::Internal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            ProtocolError::Parse("bad".into()).code(),
            ErrorCode::ParseError
        );
        assert_eq!(
            ProtocolError::UnknownType("nope".into()).code(),
            ErrorCode::UnknownMessageType
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::Internal.retryable());
        assert!(ErrorCode::SequenceConflict.retryable());
        assert!(!ErrorCode::ParseError.retryable());
        assert!(!ErrorCode::AuthFailed.retryable());
        assert!(!ErrorCode::InvalidRequest.retryable());
    }

    #[test]
    fn wire_strings() {
        assert_eq!(ErrorCode::UnknownMessageType.as_str(), "UNKNOWN_MESSAGE_TYPE");
        assert_eq!(ErrorCode::ParseError.as_str(), "PARSE_ERROR");
    }
}
