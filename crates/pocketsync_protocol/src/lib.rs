//! # PocketSync Protocol
//!
//! Wire types and JSON codecs for the PocketSync protocol.
//!
//! This crate defines:
//! - The message envelope (`{type, id, timestamp}` plus typed fields)
//! - Change records and per-collection checkpoints
//! - Subscription deltas and conflict reports
//! - The live-query grammar (filter conditions, sort clauses) and its
//!   evaluator
//!
//! All types here are pure data: no I/O, no locking, no network awareness.
//! The envelope codec is two-stage so that malformed JSON and unknown
//! message types surface as distinct error codes.
//!
//! # Protocol
//!
//! Every message is a JSON object carrying `type`, a unique `id`, and a
//! millisecond `timestamp`, plus type-specific fields. The server replies
//! to `handshake`, `push`, `pull`, `checkpoint`, `subscribe`, and `ping`;
//! `subscription-update` and `error` are server-initiated.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod change;
mod checkpoint;
mod delta;
mod envelope;
mod error;
mod query;

pub use change::{ChangeOperation, ChangeRecord};
pub use checkpoint::Checkpoint;
pub use delta::{Conflict, ConflictWinner, SubscriptionDelta};
pub use envelope::{
    now_millis, CheckpointMessage, Envelope, ErrorMessage, Handshake, HandshakeAck, Payload, Pull,
    PullResponse, Push, PushResponse, Subscribe, SubscribeAck, SubscriptionUpdate,
    PROTOCOL_VERSION,
};
pub use error::{ErrorCode, ProtocolError, ProtocolResult};
pub use query::{
    compare_documents, document_id, get_field, FilterCondition, FilterGroup, FilterNode, Query,
    SortClause,
};
