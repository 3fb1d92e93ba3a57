//! Checkpoints: per-peer cursors into the change log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cursor expressing how much change history a peer has consumed.
///
/// Checkpoints carry the last-seen sequence number per collection and
/// are exchanged in push/pull messages. They have no identity beyond
/// their contents; peers compare them by per-collection sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Checkpoint identifier (unique per issuance).
    pub id: String,
    /// Last-seen sequence per collection.
    pub sequences: BTreeMap<String, u64>,
    /// Time the checkpoint was taken, in milliseconds.
    pub timestamp: u64,
    /// The node this checkpoint belongs to.
    pub node_id: String,
}

impl Checkpoint {
    /// Creates an empty checkpoint for a node.
    pub fn new(node_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequences: BTreeMap::new(),
            timestamp,
            node_id: node_id.into(),
        }
    }

    /// Returns the last-seen sequence for a collection (0 if unseen).
    pub fn sequence_for(&self, collection: &str) -> u64 {
        self.sequences.get(collection).copied().unwrap_or(0)
    }

    /// Advances the cursor for a collection. Never moves backwards.
    pub fn advance(&mut self, collection: &str, sequence: u64) {
        let entry = self.sequences.entry(collection.to_string()).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    /// Returns true if this checkpoint is behind `other` in any collection.
    pub fn is_behind(&self, other: &Checkpoint) -> bool {
        other
            .sequences
            .iter()
            .any(|(collection, seq)| self.sequence_for(collection) < *seq)
    }
}
