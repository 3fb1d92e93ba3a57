//! # PocketSync Server
//!
//! WebSocket synchronization server for PocketSync.
//!
//! This crate provides:
//! - A WebSocket accept loop with token authentication
//! - Per-connection protocol sessions (handshake, push/pull,
//!   checkpoints, live queries)
//! - A broadcast router delivering batched subscription deltas
//!
//! # Architecture
//!
//! Each connection gets one task and one [`SyncSession`]. Sessions share
//! a [`ServerContext`] holding the change log, the client and
//! subscription registries, the delta batcher, and the router. Pushed
//! changes are appended to the log, materialized into the document
//! store, and fanned out to every affected live query.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust,ignore
//! use pocketsync_server::{ServerConfig, SyncServer, TokenValidator};
//!
//! let validator = TokenValidator::new(b"my-secure-secret".to_vec());
//! let token = validator.create_token("alice")?;
//! // Clients connect to ws://host:port/?token=<token>
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod router;
mod server;
mod session;

pub use auth::{AllowAll, Authenticator, Principal, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use router::Router;
pub use server::SyncServer;
pub use session::{
    ServerContext, ServerStats, SessionEvent, SyncSession, CLOSE_AUTH_REJECTED,
    CLOSE_TOO_MANY_CONNECTIONS, CLOSE_VERSION_MISMATCH,
};
