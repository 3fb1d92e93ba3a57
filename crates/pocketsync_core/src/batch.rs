//! Delta batching and coalescing.
//!
//! Raw deltas for a subscription are accumulated in a pending slot for
//! one batch window, coalesced down to their net effect, and flushed as
//! a single wire delta when the window timer fires or the accumulator
//! reaches the size cap. Slots are kept in a table keyed by subscription
//! id with their timer handles stored alongside, so unsubscribe and
//! disconnect can cancel a window without leaving a timer referencing
//! destroyed state.

use parking_lot::Mutex;
use pocketsync_protocol::{document_id, now_millis, SubscriptionDelta};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination for flushed deltas.
///
/// Implemented by the broadcast router; injected into the batcher at
/// construction rather than installed through shared mutable state.
pub trait DeltaSink: Send + Sync + 'static {
    /// Delivers a flushed delta to a client.
    ///
    /// Returns false if the client can no longer receive, in which case
    /// the batcher drops that client's remaining windows.
    fn deliver(&self, client_id: &str, delta: SubscriptionDelta) -> bool;
}

/// Mutable accumulator for one open batch window.
#[derive(Debug, Clone, PartialEq)]
struct PendingDelta {
    added: Vec<Value>,
    removed: Vec<String>,
    modified: Vec<Value>,
    sequence: u64,
}

impl PendingDelta {
    fn new() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            sequence: 0,
        }
    }

    fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    fn position_of(entries: &[Value], id: &str) -> Option<usize> {
        entries.iter().position(|doc| document_id(doc) == Some(id))
    }

    /// Folds an incoming delta into the accumulator.
    ///
    /// The rules keep added/removed/modified mutually exclusive per id
    /// and are associative: any grouping of the same delta stream
    /// produces the same accumulator.
    fn coalesce(&mut self, delta: &SubscriptionDelta) {
        for doc in &delta.added {
            let Some(id) = document_id(doc).map(String::from) else {
                continue;
            };
            if let Some(pos) = self.removed.iter().position(|r| *r == id) {
                // Removed then re-added within one window: the client
                // still holds it, so the net effect is a modification.
                self.removed.remove(pos);
                self.modified.push(doc.clone());
            } else if let Some(pos) = Self::position_of(&self.added, &id) {
                self.added[pos] = doc.clone();
            } else {
                self.added.push(doc.clone());
            }
        }

        for id in &delta.removed {
            if let Some(pos) = Self::position_of(&self.added, id) {
                // Added then removed within one window cancels out.
                self.added.remove(pos);
            } else if let Some(pos) = Self::position_of(&self.modified, id) {
                self.modified.remove(pos);
                self.removed.push(id.clone());
            } else if !self.removed.contains(id) {
                self.removed.push(id.clone());
            }
        }

        for doc in &delta.modified {
            let Some(id) = document_id(doc).map(String::from) else {
                continue;
            };
            if let Some(pos) = Self::position_of(&self.modified, &id) {
                self.modified[pos] = doc.clone();
            } else if let Some(pos) = Self::position_of(&self.added, &id) {
                // Still unseen by the client: the latest contents travel
                // as the add.
                self.added[pos] = doc.clone();
            } else {
                self.modified.push(doc.clone());
            }
        }

        self.sequence = self.sequence.max(delta.sequence);
    }

    /// Converts the accumulator into a wire delta, or `None` if every
    /// entry cancelled out.
    fn into_delta(self, subscription_id: &str) -> Option<SubscriptionDelta> {
        if self.len() == 0 {
            return None;
        }
        Some(SubscriptionDelta {
            subscription_id: subscription_id.to_string(),
            added: self.added,
            removed: self.removed,
            modified: self.modified,
            sequence: self.sequence,
            timestamp: now_millis(),
        })
    }
}

struct PendingSlot {
    client_id: String,
    delta: PendingDelta,
    timer: JoinHandle<()>,
}

/// Batches per-subscription deltas over a configurable window.
pub struct DeltaBatcher {
    pending: Mutex<HashMap<String, PendingSlot>>,
    interval: Duration,
    max_batch_size: usize,
    sink: Arc<dyn DeltaSink>,
}

impl DeltaBatcher {
    /// Creates a batcher delivering through `sink`.
    pub fn new(interval: Duration, max_batch_size: usize, sink: Arc<dyn DeltaSink>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            interval,
            max_batch_size,
            sink,
        })
    }

    /// Adds a delta to its subscription's batch window, opening one if
    /// none is pending. Flushes immediately when the accumulator reaches
    /// the size cap.
    pub fn enqueue(self: &Arc<Self>, client_id: &str, delta: SubscriptionDelta) {
        let subscription_id = delta.subscription_id.clone();
        let flush_now = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&subscription_id) {
                Some(slot) => {
                    slot.delta.coalesce(&delta);
                    slot.delta.len() >= self.max_batch_size
                }
                None => {
                    let mut accumulator = PendingDelta::new();
                    accumulator.coalesce(&delta);
                    let over_cap = accumulator.len() >= self.max_batch_size;
                    let timer = self.spawn_window_timer(subscription_id.clone());
                    pending.insert(
                        subscription_id.clone(),
                        PendingSlot {
                            client_id: client_id.to_string(),
                            delta: accumulator,
                            timer,
                        },
                    );
                    over_cap
                }
            }
        };

        if flush_now {
            self.flush(&subscription_id);
        }
    }

    fn spawn_window_timer(self: &Arc<Self>, subscription_id: String) -> JoinHandle<()> {
        let batcher: Weak<DeltaBatcher> = Arc::downgrade(self);
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(batcher) = batcher.upgrade() {
                batcher.flush(&subscription_id);
            }
        })
    }

    /// Closes the batch window for a subscription and delivers the
    /// coalesced delta. An empty or fully-cancelled-out accumulator
    /// emits nothing.
    pub fn flush(&self, subscription_id: &str) {
        let slot = {
            let mut pending = self.pending.lock();
            pending.remove(subscription_id)
        };
        let Some(slot) = slot else {
            return;
        };
        slot.timer.abort();

        let Some(delta) = slot.delta.into_delta(subscription_id) else {
            debug!(subscription_id, "batch window cancelled out, nothing to flush");
            return;
        };

        if !self.sink.deliver(&slot.client_id, delta) {
            warn!(
                client_id = %slot.client_id,
                "delta delivery failed, dropping client's batch windows"
            );
            self.cancel_client(&slot.client_id);
        }
    }

    /// Discards the pending window for a subscription, cancelling its
    /// timer. Called on unsubscribe.
    pub fn cancel(&self, subscription_id: &str) {
        if let Some(slot) = self.pending.lock().remove(subscription_id) {
            slot.timer.abort();
        }
    }

    /// Discards every pending window owned by a client. Called on
    /// disconnect.
    pub fn cancel_client(&self, client_id: &str) {
        let mut pending = self.pending.lock();
        let doomed: Vec<String> = pending
            .iter()
            .filter(|(_, slot)| slot.client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed {
            if let Some(slot) = pending.remove(&id) {
                slot.timer.abort();
            }
        }
    }

    /// Number of open batch windows.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
