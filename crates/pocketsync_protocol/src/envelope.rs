//! The protocol message envelope and all message types.
//!
//! Every message on the wire is a JSON object with `type`, a unique `id`,
//! and a millisecond `timestamp`, plus type-specific fields. Decoding is
//! two-stage: first the raw JSON (failures are `PARSE_ERROR`), then the
//! `type` tag (unknown tags are `UNKNOWN_MESSAGE_TYPE`), then the typed
//! body.

use crate::change::ChangeRecord;
use crate::checkpoint::Checkpoint;
use crate::delta::{Conflict, SubscriptionDelta};
use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
use crate::query::Query;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version of the sync protocol spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Message types this peer understands.
const KNOWN_TYPES: &[&str] = &[
    "handshake",
    "handshake-ack",
    "push",
    "push-response",
    "pull",
    "pull-response",
    "checkpoint",
    "checkpoint-ack",
    "subscribe",
    "subscribe-ack",
    "unsubscribe",
    "subscription-update",
    "ping",
    "pong",
    "error",
    "ack",
];

/// Returns the current wall-clock time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A protocol message: envelope fields plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id.
    pub id: String,
    /// Time the message was produced, in milliseconds.
    pub timestamp: u64,
    /// The typed message body, tagged by `type`.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Wraps a payload in a fresh envelope.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Builds an `error` message for the given code.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(Payload::Error(ErrorMessage {
            code: code.as_str().to_string(),
            message: message.into(),
            retryable: code.retryable(),
        }))
    }

    /// Encodes the envelope to a JSON string.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from a JSON string.
    ///
    /// Malformed JSON yields [`ProtocolError::Parse`]; a well-formed
    /// object with an unrecognized `type` yields
    /// [`ProtocolError::UnknownType`].
    pub fn decode(raw: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Parse(e.to_string()))?;

        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidEnvelope("missing type field".into()))?;

        if !KNOWN_TYPES.contains(&msg_type) {
            return Err(ProtocolError::UnknownType(msg_type.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    /// Returns the wire name of this message's type.
    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }
}

/// The typed body of a protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    /// Opens a session (client→server).
    Handshake(Handshake),
    /// Handshake reply (server→client).
    HandshakeAck(HandshakeAck),
    /// Uploads local changes (client→server).
    Push(Push),
    /// Push reply (server→client).
    PushResponse(PushResponse),
    /// Requests catch-up changes (client→server).
    Pull(Pull),
    /// Pull reply (server→client).
    PullResponse(PullResponse),
    /// Advertises a peer cursor (either direction).
    Checkpoint(CheckpointMessage),
    /// Checkpoint reply.
    CheckpointAck {
        /// The checkpoint that was registered.
        checkpoint: Checkpoint,
    },
    /// Registers a live query (client→server).
    Subscribe(Subscribe),
    /// Subscribe reply with the initial result set (server→client).
    SubscribeAck(SubscribeAck),
    /// Removes a live query (client→server).
    Unsubscribe {
        /// The subscription to remove.
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
    },
    /// Incremental live-query update (server→client).
    SubscriptionUpdate(SubscriptionUpdate),
    /// Liveness probe (either direction).
    Ping,
    /// Liveness reply.
    Pong {
        /// Id of the ping being answered.
        #[serde(rename = "replyTo")]
        reply_to: String,
    },
    /// Error report (server→client).
    Error(ErrorMessage),
    /// Generic acknowledgement (server→client).
    Ack {
        /// Id of the message being acknowledged.
        #[serde(rename = "originalId")]
        original_id: String,
    },
}

impl Payload {
    /// Returns the wire name of this message type.
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Handshake(_) => "handshake",
            Payload::HandshakeAck(_) => "handshake-ack",
            Payload::Push(_) => "push",
            Payload::PushResponse(_) => "push-response",
            Payload::Pull(_) => "pull",
            Payload::PullResponse(_) => "pull-response",
            Payload::Checkpoint(_) => "checkpoint",
            Payload::CheckpointAck { .. } => "checkpoint-ack",
            Payload::Subscribe(_) => "subscribe",
            Payload::SubscribeAck(_) => "subscribe-ack",
            Payload::Unsubscribe { .. } => "unsubscribe",
            Payload::SubscriptionUpdate(_) => "subscription-update",
            Payload::Ping => "ping",
            Payload::Pong { .. } => "pong",
            Payload::Error(_) => "error",
            Payload::Ack { .. } => "ack",
        }
    }
}

/// Handshake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Logical replica id; survives reconnects.
    pub node_id: String,
    /// Collections the client intends to sync.
    pub collections: Vec<String>,
    /// Capabilities the client supports.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Protocol version the client speaks.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

/// Handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    /// Whether the session was accepted.
    pub accepted: bool,
    /// Capabilities both sides support.
    pub negotiated_capabilities: Vec<String>,
    /// Server-assigned session id.
    pub session_id: String,
    /// Protocol version the server speaks.
    pub protocol_version: u16,
}

/// Push request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Push {
    /// Collection the changes belong to.
    pub collection: String,
    /// The changes, in client commit order.
    pub changes: Vec<ChangeRecord>,
    /// What the client has already seen.
    pub checkpoint: Checkpoint,
}

/// Push reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Whether every change was applied without conflict.
    pub success: bool,
    /// Conflicts detected while applying, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    /// The server cursor after the push.
    pub checkpoint: Checkpoint,
}

/// Pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pull {
    /// Collections to catch up on.
    pub collections: Vec<String>,
    /// What the client has already seen.
    pub checkpoint: Checkpoint,
    /// Maximum records per collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Pull reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// New change records, per collection, in sequence order.
    pub changes: BTreeMap<String, Vec<ChangeRecord>>,
    /// The server cursor after these changes.
    pub checkpoint: Checkpoint,
    /// True if any collection has further records beyond the limit.
    pub has_more: bool,
}

/// Checkpoint advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMessage {
    /// The session advertising the cursor.
    pub session_id: String,
    /// The cursor itself.
    pub checkpoint: Checkpoint,
    /// Collections the cursor covers.
    pub collections: Vec<String>,
}

/// Subscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The live query to register.
    pub query: Query,
}

/// Subscribe reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    /// Server-assigned subscription id.
    pub subscription_id: String,
    /// The current result set at subscription time.
    pub documents: Vec<Value>,
}

/// Incremental live-query update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    /// The coalesced delta.
    pub delta: SubscriptionDelta,
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the client may retry the failed exchange.
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeRecord;
    use serde_json::json;

    #[test]
    fn handshake_roundtrip() {
        let envelope = Envelope::new(Payload::Handshake(Handshake {
            node_id: "node-a".into(),
            collections: vec!["todos".into()],
            capabilities: vec!["live-queries".into()],
            protocol_version: PROTOCOL_VERSION,
        }));

        let raw = envelope.encode().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message_type(), "handshake");
    }

    #[test]
    fn wire_type_tag_is_kebab_case() {
        let envelope = Envelope::new(Payload::SubscriptionUpdate(SubscriptionUpdate {
            delta: SubscriptionDelta::empty("sub-1", 1, 10),
        }));
        let raw = envelope.encode().unwrap();
        assert!(raw.contains("\"type\":\"subscription-update\""));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = Envelope::decode("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse(_)));
        assert_eq!(err.code(), ErrorCode::ParseError);
    }

    #[test]
    fn unknown_type_is_distinct_from_parse_error() {
        let raw = json!({"type": "teleport", "id": "m1", "timestamp": 1}).to_string();
        let err = Envelope::decode(&raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "teleport"));
        assert_eq!(err.code(), ErrorCode::UnknownMessageType);
    }

    #[test]
    fn missing_type_field() {
        let raw = json!({"id": "m1", "timestamp": 1}).to_string();
        let err = Envelope::decode(&raw).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope(_)));
    }

    #[test]
    fn push_roundtrip() {
        let envelope = Envelope::new(Payload::Push(Push {
            collection: "todos".into(),
            changes: vec![ChangeRecord::insert(
                "todos",
                "d1",
                json!({"title": "x"}),
                5,
                "node-a",
            )],
            checkpoint: Checkpoint::new("node-a", 5),
        }));
        let raw = envelope.encode().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn ping_pong() {
        let ping = Envelope::new(Payload::Ping);
        let raw = ping.encode().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded.payload, Payload::Ping);

        let pong = Envelope::new(Payload::Pong {
            reply_to: ping.id.clone(),
        });
        let raw = pong.encode().unwrap();
        match Envelope::decode(&raw).unwrap().payload {
            Payload::Pong { reply_to } => assert_eq!(reply_to, ping.id),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn error_helper_sets_retryable() {
        let envelope = Envelope::error(ErrorCode::SequenceConflict, "regression");
        match envelope.payload {
            Payload::Error(err) => {
                assert_eq!(err.code, "SEQUENCE_CONFLICT");
                assert!(err.retryable);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn handshake_defaults_protocol_version() {
        let raw = json!({
            "type": "handshake",
            "id": "m1",
            "timestamp": 1,
            "nodeId": "node-a",
            "collections": ["todos"]
        })
        .to_string();
        let decoded = Envelope::decode(&raw).unwrap();
        match decoded.payload {
            Payload::Handshake(hs) => {
                assert_eq!(hs.protocol_version, PROTOCOL_VERSION);
                assert!(hs.capabilities.is_empty());
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }
}
