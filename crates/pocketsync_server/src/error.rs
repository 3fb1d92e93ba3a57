//! Error types for the sync server.

use pocketsync_core::CoreError;
use pocketsync_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or contents.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A message arrived before the handshake completed.
    #[error("handshake required before {0}")]
    HandshakeRequired(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: client speaks {client}, server speaks {server}")]
    VersionMismatch {
        /// Version the client announced.
        client: u16,
        /// Version this server speaks.
        server: u16,
    },

    /// Wire decoding or encoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A core component rejected the operation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Maps this error to its wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServerError::AuthenticationFailed(_) => ErrorCode::AuthFailed,
            ServerError::HandshakeRequired(_) => ErrorCode::HandshakeRequired,
            ServerError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            ServerError::Protocol(err) => err.code(),
            ServerError::Core(err) => err.code(),
            ServerError::WebSocket(_) | ServerError::Io(_) => ErrorCode::Internal,
        }
    }
}
