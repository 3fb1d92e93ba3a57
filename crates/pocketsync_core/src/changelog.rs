//! The append-only change log.
//!
//! The log is the single source of truth for replicated history and the
//! only component permitted to assign sequence numbers. Sequences are
//! per collection, strictly increasing, and never reused. Registered
//! peer checkpoints bound what compaction may remove.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use pocketsync_protocol::{now_millis, ChangeOperation, ChangeRecord, Checkpoint};
use std::collections::HashMap;

#[derive(Default)]
struct LogInner {
    /// Records per collection, in sequence order.
    records: HashMap<String, Vec<ChangeRecord>>,
    /// Highest assigned sequence per collection.
    sequences: HashMap<String, u64>,
    /// Latest sequence per (collection, document). Survives compaction
    /// so conflict detection keeps working after old rows are dropped.
    latest: HashMap<(String, String), u64>,
    /// Registered peer cursors, keyed by node id.
    checkpoints: HashMap<String, Checkpoint>,
    closed: bool,
}

/// The append-only, per-collection change log.
///
/// All mutation goes through [`append`](ChangeLog::append); every other
/// component treats the log as read-only. Append and sequence assignment
/// happen under one write lock, so two concurrent pushes to the same
/// collection can never receive the same sequence number.
pub struct ChangeLog {
    inner: RwLock<LogInner>,
}

impl ChangeLog {
    /// Creates a new empty change log.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
        }
    }

    /// Appends a change and returns its assigned sequence.
    ///
    /// The caller's `sequence` field is ignored unless it is non-zero and
    /// would regress the collection, in which case the append fails with
    /// [`CoreError::SequenceConflict`] instead of silently overwriting.
    pub fn append(&self, mut record: ChangeRecord) -> CoreResult<u64> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CoreError::LogClosed);
        }

        let current = inner
            .sequences
            .get(&record.collection)
            .copied()
            .unwrap_or(0);
        if record.sequence != 0 && record.sequence <= current {
            return Err(CoreError::SequenceConflict {
                collection: record.collection.clone(),
                current,
                attempted: record.sequence,
            });
        }

        let sequence = current + 1;
        record.sequence = sequence;
        inner
            .sequences
            .insert(record.collection.clone(), sequence);
        inner.latest.insert(
            (record.collection.clone(), record.document_id.clone()),
            sequence,
        );
        inner
            .records
            .entry(record.collection.clone())
            .or_default()
            .push(record);

        Ok(sequence)
    }

    /// Returns records for a collection with sequence strictly greater
    /// than `from_sequence`, up to `limit`, in sequence order.
    ///
    /// Pagination is resumable: the same cursor and limit return the
    /// same records until new ones are appended.
    pub fn get_for_collection(
        &self,
        collection: &str,
        from_sequence: u64,
        limit: usize,
    ) -> Vec<ChangeRecord> {
        let inner = self.inner.read();
        inner
            .records
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sequence > from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if more records exist beyond `from_sequence + limit`.
    pub fn has_more(&self, collection: &str, from_sequence: u64, limit: usize) -> bool {
        let inner = self.inner.read();
        inner
            .records
            .get(collection)
            .map(|records| {
                records.iter().filter(|r| r.sequence > from_sequence).count() > limit
            })
            .unwrap_or(false)
    }

    /// Returns the highest assigned sequence for a collection (0 if none).
    pub fn current_sequence(&self, collection: &str) -> u64 {
        self.inner
            .read()
            .sequences
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the latest sequence recorded for a document (0 if never
    /// seen). Unlike record lookups, this survives compaction.
    pub fn latest_sequence_for(&self, collection: &str, document_id: &str) -> u64 {
        self.inner
            .read()
            .latest
            .get(&(collection.to_string(), document_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the latest surviving record for a document.
    pub fn latest_record_for(&self, collection: &str, document_id: &str) -> Option<ChangeRecord> {
        let inner = self.inner.read();
        inner
            .records
            .get(collection)?
            .iter()
            .rev()
            .find(|r| r.document_id == document_id)
            .cloned()
    }

    /// Registers or replaces a peer checkpoint.
    ///
    /// Compaction never removes a record at or above any registered
    /// checkpoint's cursor for its collection.
    pub fn register_checkpoint(&self, checkpoint: Checkpoint) {
        let mut inner = self.inner.write();
        inner
            .checkpoints
            .insert(checkpoint.node_id.clone(), checkpoint);
    }

    /// Removes the checkpoint registered for a node, releasing its
    /// retention hold.
    pub fn unregister_checkpoint(&self, node_id: &str) -> Option<Checkpoint> {
        self.inner.write().checkpoints.remove(node_id)
    }

    /// Builds a checkpoint describing the log's current position across
    /// all collections.
    pub fn checkpoint(&self, node_id: &str) -> Checkpoint {
        let inner = self.inner.read();
        let mut checkpoint = Checkpoint::new(node_id, now_millis());
        for (collection, sequence) in &inner.sequences {
            checkpoint.advance(collection, *sequence);
        }
        checkpoint
    }

    /// Removes superseded records below `before_sequence`.
    ///
    /// A record is removable when a newer record for the same document
    /// exists, or when it is a delete with no later history (the
    /// insert+delete collapse). The boundary is clamped per collection to
    /// the minimum registered checkpoint, so no peer ever loses a record
    /// it still needs. Returns the number of records removed.
    pub fn compact(&self, before_sequence: u64) -> usize {
        let mut inner = self.inner.write();

        let collections: Vec<String> = inner.records.keys().cloned().collect();
        let mut removed = 0;

        for collection in collections {
            let floor = inner
                .checkpoints
                .values()
                .map(|cp| cp.sequence_for(&collection))
                .min()
                .unwrap_or(u64::MAX);
            let cutoff = before_sequence.min(floor);

            let latest = &inner.latest;
            if let Some(records) = inner.records.get(&collection) {
                let keep: Vec<ChangeRecord> = records
                    .iter()
                    .filter(|r| {
                        if r.sequence >= cutoff {
                            return true;
                        }
                        let newest = latest
                            .get(&(collection.clone(), r.document_id.clone()))
                            .copied()
                            .unwrap_or(0);
                        if newest > r.sequence {
                            return false;
                        }
                        // Final record for this document: a delete below
                        // the cutoff leaves nothing worth replaying.
                        r.operation != ChangeOperation::Delete
                    })
                    .cloned()
                    .collect();
                removed += records.len() - keep.len();
                inner.records.insert(collection.clone(), keep);
            }
        }

        removed
    }

    /// Closes the log. All subsequent appends fail with
    /// [`CoreError::LogClosed`].
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    /// Returns true if the log has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Total number of records across all collections.
    pub fn len(&self) -> usize {
        self.inner.read().records.values().map(Vec::len).sum()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}
