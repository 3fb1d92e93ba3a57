//! Subscription deltas and push conflict reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The net effect of one or more changes on a subscription's result set.
///
/// `added`, `removed`, and `modified` are mutually exclusive per document
/// id within one delta; the batching engine enforces this invariant when
/// coalescing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDelta {
    /// The subscription this delta applies to.
    pub subscription_id: String,
    /// Documents that entered the result set.
    pub added: Vec<Value>,
    /// Ids of documents that left the result set.
    pub removed: Vec<String>,
    /// Documents that stayed in the set with new contents.
    pub modified: Vec<Value>,
    /// Per-subscription delivery sequence, strictly increasing.
    pub sequence: u64,
    /// Time the delta was produced, in milliseconds.
    pub timestamp: u64,
}

impl SubscriptionDelta {
    /// Creates an empty delta for a subscription.
    pub fn empty(subscription_id: impl Into<String>, sequence: u64, timestamp: u64) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            sequence,
            timestamp,
        }
    }

    /// Total number of entries across all three sets.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    /// Returns true if the delta carries no changes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which side of a conflict the resolver chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    /// The server's version stood.
    Local,
    /// The pushed version was applied.
    Remote,
    /// The resolver produced a merged document.
    Merged,
}

/// A conflict detected while applying a pushed change.
///
/// Reported inside `push-response`; the connection stays open and the
/// client decides how to proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Collection the conflicting document belongs to.
    pub collection: String,
    /// The conflicting document id.
    pub document_id: String,
    /// The server's version at push time (absent if deleted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<Value>,
    /// The pushed version (absent for a pushed delete).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<Value>,
    /// The document that was ultimately applied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<Value>,
    /// Which side won.
    pub winner: ConflictWinner,
}
