//! The WebSocket sync server.
//!
//! One task per connection: the task accepts the WebSocket upgrade at
//! the configured path, authenticates the `token` query parameter, then
//! loops over inbound
//! frames and the connection's outbound queue. Everything
//! protocol-level lives in [`SyncSession`]; this module only moves
//! frames.

use crate::auth::{AllowAll, Authenticator};
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::session::{ServerContext, SessionEvent, SyncSession, CLOSE_AUTH_REJECTED};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pocketsync_core::{ConflictResolver, DocumentStore, LastWriteWins};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// The sync server.
///
/// # Example
///
/// ```rust,ignore
/// use pocketsync_server::{ServerConfig, SyncServer};
/// use pocketsync_core::MemoryDocumentStore;
/// use std::sync::Arc;
///
/// let config = ServerConfig::new("127.0.0.1:8080".parse()?);
/// let server = SyncServer::new(config, Arc::new(MemoryDocumentStore::new()));
/// server.run().await?;
/// ```
pub struct SyncServer {
    context: Arc<ServerContext>,
}

impl SyncServer {
    /// Creates a server with no authentication and last-write-wins
    /// conflict resolution.
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_components(config, store, Arc::new(AllowAll), Arc::new(LastWriteWins))
    }

    /// Creates a server with explicit authentication and conflict policy.
    pub fn with_components(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        authenticator: Arc<dyn Authenticator>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            context: ServerContext::new(config, store, authenticator, resolver),
        }
    }

    /// The shared state behind all sessions.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Binds the configured address and serves connections forever.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.context.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "sync server listening");
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        self.spawn_idle_pruner();

        loop {
            let (stream, addr) = listener.accept().await?;

            if self.context.clients.len() >= self.context.config.max_connections {
                warn!(%addr, "connection limit reached, refusing");
                drop(stream);
                continue;
            }

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(context, stream, addr).await {
                    debug!(%addr, %err, "connection ended with error");
                }
            });
        }
    }

    /// Periodically evicts sessions that stopped sending anything.
    fn spawn_idle_pruner(&self) {
        let context = self.context.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(context.config.prune_interval);
            loop {
                ticker.tick().await;
                for client_id in context.clients.prune_idle(context.config.idle_ttl) {
                    warn!(client_id, "pruning idle session");
                    context.cleanup_client(&client_id);
                }
            }
        });
    }
}

async fn handle_connection(
    context: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
) -> ServerResult<()> {
    let ws_path = context.config.ws_path.clone();
    let mut token: Option<String> = None;
    let mut node_id: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response| {
        if request.uri().path() != ws_path {
            let mut not_found = ErrorResponse::new(Some("no such endpoint".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        let query = request.uri().query().unwrap_or("");
        token = query_param(query, "token");
        node_id = query_param(query, "nodeId");
        Ok::<Response, _>(response)
    })
    .await?;
    context.connection_opened();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    debug!(%addr, node_id = ?node_id, "websocket established");

    let principal = match context.authenticator.authenticate(token.as_deref()) {
        Ok(principal) => principal,
        Err(err) => {
            warn!(%addr, %err, "authentication rejected");
            let _ = ws_sender
                .send(close_message(CLOSE_AUTH_REJECTED, "authentication rejected"))
                .await;
            return Ok(());
        }
    };
    if context.config.require_auth && principal.is_none() {
        warn!(%addr, "unauthenticated connection refused");
        let _ = ws_sender
            .send(close_message(CLOSE_AUTH_REJECTED, "authentication required"))
            .await;
        return Ok(());
    }

    let mut session = SyncSession::new(context.clone(), principal);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(context.config.outbound_queue_size);
    context.router.attach(session.client_id(), outbound_tx);

    let handshake_deadline = tokio::time::sleep(context.config.handshake_timeout);
    tokio::pin!(handshake_deadline);

    loop {
        tokio::select! {
            () = &mut handshake_deadline, if !session.is_ready() => {
                debug!(%addr, "handshake timeout");
                let _ = ws_sender
                    .send(close_message(1002, "handshake timeout"))
                    .await;
                break;
            }

            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let events = session.handle_message(text.as_str());
                        if dispatch_events(&mut ws_sender, events).await? {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%addr, "connection closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%addr, %err, "websocket error");
                        break;
                    }
                }
            }

            // Outbound queue: replies from other tasks (flushed deltas).
            // The router dropping our sender ends the loop.
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let text = envelope.encode()?;
                        ws_sender.send(Message::Text(text.into())).await?;
                    }
                    None => {
                        debug!(%addr, "outbound queue detached");
                        break;
                    }
                }
            }
        }
    }

    session.on_disconnect();
    Ok(())
}

/// Sends a session's events, returning true if the connection closed.
async fn dispatch_events(
    sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    events: Vec<SessionEvent>,
) -> ServerResult<bool> {
    for event in events {
        match event {
            SessionEvent::Reply(envelope) => {
                let text = envelope.encode()?;
                sender.send(Message::Text(text.into())).await?;
            }
            SessionEvent::Close { code, reason } => {
                sender.send(close_message(code, &reason)).await?;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Extracts a raw query parameter. Tokens are hex and dots, so no
/// percent-decoding is needed.
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocketsync_core::MemoryDocumentStore;

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param("token=abc.1.ff&nodeId=n1", "token"),
            Some("abc.1.ff".to_string())
        );
        assert_eq!(
            query_param("token=abc&nodeId=n1", "nodeId"),
            Some("n1".to_string())
        );
        assert_eq!(query_param("token=abc", "missing"), None);
        assert_eq!(query_param("", "token"), None);
    }

    #[test]
    fn server_construction() {
        let server = SyncServer::new(
            ServerConfig::default(),
            Arc::new(MemoryDocumentStore::new()),
        );
        assert!(server.context().clients.is_empty());
        assert!(!server.context().config.require_auth);
    }
}
