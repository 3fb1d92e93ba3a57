//! Broadcast router: per-client outbound queues.
//!
//! Each connection task owns the receiving half of a bounded channel;
//! the router holds the senders. Delivery never blocks: a full or
//! closed queue detaches the client, and dropping its sender closes the
//! connection task's receive loop, which runs full disconnect cleanup.

use parking_lot::RwLock;
use pocketsync_core::DeltaSink;
use pocketsync_protocol::{Envelope, Payload, SubscriptionDelta, SubscriptionUpdate};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Routes outbound envelopes to connected clients.
pub struct Router {
    clients: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Attaches a client's outbound queue.
    pub fn attach(&self, client_id: &str, sender: mpsc::Sender<Envelope>) {
        self.clients.write().insert(client_id.to_string(), sender);
    }

    /// Detaches a client. Dropping the sender ends the connection task's
    /// outbound loop.
    pub fn detach(&self, client_id: &str) {
        self.clients.write().remove(client_id);
    }

    /// Queues an envelope for a client without blocking.
    ///
    /// Returns false if the client is unknown or its queue is full or
    /// closed; in the latter cases the client is detached. A slow
    /// consumer loses its connection rather than stalling the caller.
    pub fn send(&self, client_id: &str, envelope: Envelope) -> bool {
        let sender = match self.clients.read().get(client_id) {
            Some(sender) => sender.clone(),
            None => {
                debug!(client_id, "send to unknown client dropped");
                return false;
            }
        };

        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "outbound queue full, detaching slow client");
                self.detach(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.detach(client_id);
                false
            }
        }
    }

    /// Number of attached clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Returns true if no clients are attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaSink for Router {
    fn deliver(&self, client_id: &str, delta: SubscriptionDelta) -> bool {
        let envelope = Envelope::new(Payload::SubscriptionUpdate(SubscriptionUpdate { delta }));
        self.send(client_id, envelope)
    }
}
