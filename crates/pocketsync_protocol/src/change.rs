//! Change records: the unit of replicated history.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// A document was inserted.
    Insert,
    /// A document was updated.
    Update,
    /// A document was deleted.
    Delete,
}

/// A single entry in the append-only change log.
///
/// Change records are immutable once appended. Sequence numbers are
/// assigned per collection by the change log at append time and are
/// never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Per-collection sequence number, assigned by the log.
    pub sequence: u64,
    /// Collection the change belongs to.
    pub collection: String,
    /// The kind of mutation.
    pub operation: ChangeOperation,
    /// Identifier of the affected document.
    pub document_id: String,
    /// Document snapshot after the change (absent on delete).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    /// Document snapshot before the change, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_document: Option<Value>,
    /// Wall-clock time of the change in milliseconds.
    pub timestamp: u64,
    /// Logical replica that originated the change.
    pub origin_node_id: String,
}

impl ChangeRecord {
    /// Creates an insert record. The sequence is assigned at append time.
    pub fn insert(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document: Value,
        timestamp: u64,
        origin_node_id: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            collection: collection.into(),
            operation: ChangeOperation::Insert,
            document_id: document_id.into(),
            document: Some(document),
            previous_document: None,
            timestamp,
            origin_node_id: origin_node_id.into(),
        }
    }

    /// Creates an update record.
    pub fn update(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document: Value,
        previous: Option<Value>,
        timestamp: u64,
        origin_node_id: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            collection: collection.into(),
            operation: ChangeOperation::Update,
            document_id: document_id.into(),
            document: Some(document),
            previous_document: previous,
            timestamp,
            origin_node_id: origin_node_id.into(),
        }
    }

    /// Creates a delete record.
    pub fn delete(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        previous: Option<Value>,
        timestamp: u64,
        origin_node_id: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            collection: collection.into(),
            operation: ChangeOperation::Delete,
            document_id: document_id.into(),
            document: None,
            previous_document: previous,
            timestamp,
            origin_node_id: origin_node_id.into(),
        }
    }

    /// Returns true for insert and update records.
    pub fn carries_document(&self) -> bool {
        matches!(
            self.operation,
            ChangeOperation::Insert | ChangeOperation::Update
        )
    }
}
