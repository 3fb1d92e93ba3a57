//! Per-connection protocol sessions.
//!
//! A [`SyncSession`] owns the protocol state machine for one WebSocket
//! connection: handshake, push/pull, checkpoints, and live query
//! management. It is transport-agnostic; the connection task feeds it
//! raw message text and acts on the returned [`SessionEvent`]s, which
//! keeps the whole protocol exercisable in tests without sockets.

use crate::auth::{Authenticator, Principal};
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::router::Router;
use pocketsync_core::{
    ChangeLog, ClientRegistry, ClientSession, ConflictResolver, DeltaBatcher, DeltaSink,
    DocumentStore, Resolution, SubscriptionRegistry,
};
use pocketsync_protocol::{
    document_id, ChangeRecord, CheckpointMessage, Conflict, ConflictWinner, Envelope, ErrorCode,
    HandshakeAck, Payload, Pull, PullResponse, Push, PushResponse, Subscribe, SubscribeAck,
    PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use std::sync::Arc;

/// Capabilities this server supports.
const SERVER_CAPABILITIES: &[&str] = &["live-queries", "delta-batching"];

/// WebSocket close code for a rejected token.
pub const CLOSE_AUTH_REJECTED: u16 = 4001;
/// WebSocket close code for the per-user connection cap.
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4002;
/// WebSocket close code for a protocol version mismatch.
pub const CLOSE_VERSION_MISMATCH: u16 = 4003;

/// Shared state behind every session.
pub struct ServerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The append-only change log.
    pub log: Arc<ChangeLog>,
    /// Live connection registry.
    pub clients: Arc<ClientRegistry>,
    /// Live query registry and delta computer.
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Delta batching engine.
    pub batcher: Arc<DeltaBatcher>,
    /// Outbound broadcast router.
    pub router: Arc<Router>,
    /// Materialized document storage.
    pub store: Arc<dyn DocumentStore>,
    /// Connection authenticator.
    pub authenticator: Arc<dyn Authenticator>,
    /// Push conflict policy.
    pub resolver: Arc<dyn ConflictResolver>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicU64,
    messages_received: AtomicU64,
    changes_appended: AtomicU64,
    deltas_broadcast: AtomicU64,
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted since startup.
    pub connections_opened: u64,
    /// Sessions currently registered.
    pub active_sessions: usize,
    /// Protocol messages handled.
    pub messages_received: u64,
    /// Changes appended to the log.
    pub changes_appended: u64,
    /// Subscription deltas queued for delivery.
    pub deltas_broadcast: u64,
    /// Live subscriptions.
    pub live_subscriptions: usize,
}

impl ServerContext {
    /// Wires up the shared components for a server.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Arc<Self> {
        let router = Arc::new(Router::new());
        let batcher = DeltaBatcher::new(
            config.batch_interval,
            config.max_batch_size,
            router.clone() as Arc<dyn DeltaSink>,
        );
        Arc::new(Self {
            clients: Arc::new(ClientRegistry::new(config.max_clients_per_user)),
            subscriptions: Arc::new(SubscriptionRegistry::new(
                config.max_subscriptions_per_client,
            )),
            log: Arc::new(ChangeLog::new()),
            batcher,
            router,
            store,
            authenticator,
            resolver,
            config,
            counters: Counters::default(),
        })
    }

    /// Snapshots the server counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections_opened: self.counters.connections_opened.load(Ordering::Relaxed),
            active_sessions: self.clients.len(),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            changes_appended: self.counters.changes_appended.load(Ordering::Relaxed),
            deltas_broadcast: self.counters.deltas_broadcast.load(Ordering::Relaxed),
            live_subscriptions: self.subscriptions.len(),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Fans an appended change out to every affected subscription except
    /// those owned by the originating client, which already holds it.
    ///
    /// Delta computation and enqueueing happen under one registry lock
    /// hold per subscription, so concurrent pushers cannot reorder a
    /// subscription's deltas between sequencing and the batcher.
    pub fn broadcast(&self, origin_client_id: &str, change: &ChangeRecord) {
        for subscription in self
            .subscriptions
            .subscriptions_for_collection(&change.collection)
        {
            if subscription.client_id == origin_client_id {
                continue;
            }
            let result = self
                .subscriptions
                .notify(&subscription.id, change, |client_id, delta| {
                    self.counters.deltas_broadcast.fetch_add(1, Ordering::Relaxed);
                    self.batcher.enqueue(client_id, delta);
                });
            if let Err(err) = result {
                // The subscription raced an unsubscribe; nothing to do.
                debug!(subscription_id = %subscription.id, %err, "delta computation skipped");
            }
        }
    }

    /// Tears down every resource owned by a client connection.
    pub fn cleanup_client(&self, client_id: &str) {
        self.batcher.cancel_client(client_id);
        for subscription_id in self.subscriptions.unregister_client(client_id) {
            self.batcher.cancel(&subscription_id);
        }
        self.router.detach(client_id);
        self.clients.deregister(client_id);
    }
}

/// Something the connection task must do after handling a message.
#[derive(Debug)]
pub enum SessionEvent {
    /// Send an envelope to this client.
    Reply(Envelope),
    /// Close the connection with the given code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    AwaitingHandshake,
    Ready,
    Closed,
}

/// Protocol state machine for one connection.
pub struct SyncSession {
    context: Arc<ServerContext>,
    client_id: String,
    principal: Option<Principal>,
    node_id: Option<String>,
    phase: SessionPhase,
}

impl SyncSession {
    /// Creates a session for an accepted (and authenticated) connection.
    pub fn new(context: Arc<ServerContext>, principal: Option<Principal>) -> Self {
        Self {
            context,
            client_id: uuid::Uuid::new_v4().to_string(),
            principal,
            node_id: None,
            phase: SessionPhase::AwaitingHandshake,
        }
    }

    /// The connection-scoped client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns true once the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    /// Handles one inbound message, returning the events to act on.
    ///
    /// Once the session is established, malformed or unexpected messages
    /// produce `error` replies and leave the connection open. Before the
    /// handshake, undecodable traffic is fatal, as are authentication
    /// failures, connection caps, and version mismatches.
    pub fn handle_message(&mut self, raw: &str) -> Vec<SessionEvent> {
        if self.phase == SessionPhase::Closed {
            return Vec::new();
        }
        self.context
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(client_id = %self.client_id, %err, "undecodable message");
                let reply = SessionEvent::Reply(Envelope::error(err.code(), err.to_string()));
                if self.phase == SessionPhase::AwaitingHandshake {
                    return vec![
                        reply,
                        SessionEvent::Close {
                            code: 1002,
                            reason: "malformed handshake".into(),
                        },
                    ];
                }
                return vec![reply];
            }
        };

        self.context.clients.heartbeat(&self.client_id);

        if self.phase == SessionPhase::AwaitingHandshake {
            return match envelope.payload {
                Payload::Handshake(handshake) => self.handle_handshake(handshake),
                other => vec![SessionEvent::Reply(Envelope::error(
                    ErrorCode::HandshakeRequired,
                    format!("{} before handshake", other.message_type()),
                ))],
            };
        }

        match envelope.payload {
            Payload::Handshake(_) => vec![SessionEvent::Reply(Envelope::error(
                ErrorCode::InvalidRequest,
                "session already established",
            ))],
            Payload::Push(push) => self.handle_push(push),
            Payload::Pull(pull) => self.handle_pull(pull),
            Payload::Checkpoint(message) => self.handle_checkpoint(message),
            Payload::Subscribe(subscribe) => self.handle_subscribe(subscribe),
            Payload::Unsubscribe { subscription_id } => {
                self.handle_unsubscribe(&envelope.id, &subscription_id)
            }
            Payload::Ping => vec![SessionEvent::Reply(Envelope::new(Payload::Pong {
                reply_to: envelope.id,
            }))],
            Payload::Pong { .. } | Payload::Ack { .. } => Vec::new(),
            other => vec![SessionEvent::Reply(Envelope::error(
                ErrorCode::InvalidRequest,
                format!("unexpected client message: {}", other.message_type()),
            ))],
        }
    }

    /// Runs disconnect cleanup. Idempotent; the connection task calls it
    /// on every exit path.
    ///
    /// The node's registered checkpoint stays in place so the change log
    /// retains what the replica still needs across reconnects.
    pub fn on_disconnect(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.phase = SessionPhase::Closed;
        self.context.cleanup_client(&self.client_id);
        info!(client_id = %self.client_id, node_id = ?self.node_id, "session closed");
    }

    fn handle_handshake(
        &mut self,
        handshake: pocketsync_protocol::Handshake,
    ) -> Vec<SessionEvent> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return vec![
                SessionEvent::Reply(Envelope::error(
                    ErrorCode::VersionMismatch,
                    format!(
                        "client speaks protocol {}, server speaks {}",
                        handshake.protocol_version, PROTOCOL_VERSION
                    ),
                )),
                SessionEvent::Close {
                    code: CLOSE_VERSION_MISMATCH,
                    reason: "protocol version mismatch".into(),
                },
            ];
        }

        let session = ClientSession::new(
            self.client_id.clone(),
            handshake.node_id.clone(),
            self.principal.as_ref().map(|p| p.user_id.clone()),
            handshake.collections.clone(),
        );
        if let Err(err) = self.context.clients.register(session) {
            return vec![
                SessionEvent::Reply(Envelope::error(err.code(), err.to_string())),
                SessionEvent::Close {
                    code: CLOSE_TOO_MANY_CONNECTIONS,
                    reason: "connection limit reached".into(),
                },
            ];
        }

        let negotiated: Vec<String> = handshake
            .capabilities
            .iter()
            .filter(|cap| SERVER_CAPABILITIES.contains(&cap.as_str()))
            .cloned()
            .collect();

        self.node_id = Some(handshake.node_id.clone());
        self.phase = SessionPhase::Ready;
        info!(
            client_id = %self.client_id,
            node_id = %handshake.node_id,
            collections = ?handshake.collections,
            "session established"
        );

        vec![SessionEvent::Reply(Envelope::new(Payload::HandshakeAck(
            HandshakeAck {
                accepted: true,
                negotiated_capabilities: negotiated,
                session_id: self.client_id.clone(),
                protocol_version: PROTOCOL_VERSION,
            },
        )))]
    }

    fn handle_push(&mut self, push: Push) -> Vec<SessionEvent> {
        if push.changes.len() > self.context.config.max_push_batch {
            return vec![SessionEvent::Reply(Envelope::error(
                ErrorCode::InvalidRequest,
                format!(
                    "push of {} changes exceeds limit of {}",
                    push.changes.len(),
                    self.context.config.max_push_batch
                ),
            ))];
        }

        let mut conflicts = Vec::new();
        for change in push.changes {
            let result = self.apply_pushed_change(change, &push.checkpoint, &mut conflicts);
            if let Err(err) = result {
                warn!(client_id = %self.client_id, %err, "push aborted");
                return vec![SessionEvent::Reply(Envelope::error(
                    err.code(),
                    err.to_string(),
                ))];
            }
        }

        let node_id = self.node_id.as_deref().unwrap_or(&self.client_id);
        let response = PushResponse {
            success: conflicts.is_empty(),
            conflicts,
            checkpoint: self.context.log.checkpoint(node_id),
        };
        vec![SessionEvent::Reply(Envelope::new(Payload::PushResponse(
            response,
        )))]
    }

    /// Applies one pushed change, detecting and resolving conflicts.
    ///
    /// A change conflicts when the server's history for its document has
    /// advanced past what the pusher's checkpoint says it has seen.
    fn apply_pushed_change(
        &self,
        change: ChangeRecord,
        checkpoint: &pocketsync_protocol::Checkpoint,
        conflicts: &mut Vec<Conflict>,
    ) -> ServerResult<()> {
        let server_latest = self
            .context
            .log
            .latest_sequence_for(&change.collection, &change.document_id);
        let client_seen = checkpoint.sequence_for(&change.collection);

        if server_latest == 0 || server_latest <= client_seen {
            self.apply_change(change)?;
            return Ok(());
        }

        let local = self
            .context
            .log
            .latest_record_for(&change.collection, &change.document_id);
        let Some(local) = local else {
            // History for this document was compacted away; nothing to
            // compare against, so the pushed change stands.
            self.apply_change(change)?;
            return Ok(());
        };

        let resolution = self.context.resolver.resolve(&local, &change);
        let (winner, resolved) = match &resolution {
            Resolution::UseLocal => (ConflictWinner::Local, local.document.clone()),
            Resolution::UseRemote => (ConflictWinner::Remote, change.document.clone()),
            Resolution::Merged(doc) => (ConflictWinner::Merged, Some(doc.clone())),
        };
        conflicts.push(Conflict {
            collection: change.collection.clone(),
            document_id: change.document_id.clone(),
            local: local.document.clone(),
            remote: change.document.clone(),
            resolved,
            winner,
        });

        match resolution {
            Resolution::UseLocal => Ok(()),
            Resolution::UseRemote => self.apply_change(change),
            Resolution::Merged(merged) => {
                let record = ChangeRecord::update(
                    change.collection.clone(),
                    change.document_id.clone(),
                    merged,
                    local.document,
                    change.timestamp,
                    change.origin_node_id.clone(),
                );
                self.apply_change(record)
            }
        }
    }

    /// Appends a change to the log, materializes it, and fans it out.
    fn apply_change(&self, mut record: ChangeRecord) -> ServerResult<()> {
        record.sequence = 0;
        let sequence = self.context.log.append(record.clone())?;
        record.sequence = sequence;
        self.context
            .counters
            .changes_appended
            .fetch_add(1, Ordering::Relaxed);
        self.context.store.apply(&record);
        self.context.broadcast(&self.client_id, &record);
        Ok(())
    }

    fn handle_pull(&self, pull: Pull) -> Vec<SessionEvent> {
        let limit = pull
            .limit
            .unwrap_or(self.context.config.max_pull_batch)
            .min(self.context.config.max_pull_batch) as usize;

        let mut changes = BTreeMap::new();
        let mut checkpoint = pull.checkpoint.clone();
        let mut has_more = false;

        for collection in &pull.collections {
            let from = pull.checkpoint.sequence_for(collection);
            let records = self.context.log.get_for_collection(collection, from, limit);
            has_more |= self.context.log.has_more(collection, from, limit);
            if let Some(last) = records.last() {
                checkpoint.advance(collection, last.sequence);
            }
            changes.insert(collection.clone(), records);
        }

        vec![SessionEvent::Reply(Envelope::new(Payload::PullResponse(
            PullResponse {
                changes,
                checkpoint,
                has_more,
            },
        )))]
    }

    fn handle_checkpoint(&self, message: CheckpointMessage) -> Vec<SessionEvent> {
        debug!(
            client_id = %self.client_id,
            node_id = %message.checkpoint.node_id,
            "checkpoint registered"
        );
        self.context
            .log
            .register_checkpoint(message.checkpoint.clone());
        vec![SessionEvent::Reply(Envelope::new(Payload::CheckpointAck {
            checkpoint: message.checkpoint,
        }))]
    }

    fn handle_subscribe(&self, subscribe: Subscribe) -> Vec<SessionEvent> {
        let documents = self.context.store.query(&subscribe.query);
        let initial_ids = documents
            .iter()
            .filter_map(|doc| document_id(doc).map(String::from))
            .collect();

        match self
            .context
            .subscriptions
            .register(&self.client_id, subscribe.query, initial_ids)
        {
            Ok(state) => {
                debug!(
                    client_id = %self.client_id,
                    subscription_id = %state.id,
                    documents = documents.len(),
                    "subscription registered"
                );
                vec![SessionEvent::Reply(Envelope::new(Payload::SubscribeAck(
                    SubscribeAck {
                        subscription_id: state.id,
                        documents,
                    },
                )))]
            }
            Err(err) => vec![SessionEvent::Reply(Envelope::error(
                err.code(),
                err.to_string(),
            ))],
        }
    }

    /// Unsubscribe is idempotent: an unknown id is acknowledged the same
    /// as a live one.
    fn handle_unsubscribe(&self, original_id: &str, subscription_id: &str) -> Vec<SessionEvent> {
        self.context.subscriptions.unregister(subscription_id);
        self.context.batcher.cancel(subscription_id);
        vec![SessionEvent::Reply(Envelope::new(Payload::Ack {
            original_id: original_id.to_string(),
        }))]
    }
}
