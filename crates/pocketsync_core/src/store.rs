//! The storage-engine seam.
//!
//! Sessions read and write materialized documents through
//! [`DocumentStore`]; the change log records history separately. The
//! in-memory implementation backs tests and the demo binary. A durable
//! engine plugs in behind the same trait.

use parking_lot::RwLock;
use pocketsync_protocol::{
    compare_documents, document_id, ChangeOperation, ChangeRecord, Query,
};
use serde_json::Value;
use std::collections::HashMap;

/// Materialized document storage, keyed by collection and document id.
///
/// Methods are synchronous and must not block for long; implementations
/// over slow media should keep a cache in front of this seam.
pub trait DocumentStore: Send + Sync {
    /// Returns the current version of a document.
    fn get(&self, collection: &str, document_id: &str) -> Option<Value>;

    /// Inserts or replaces a document, returning the previous version.
    ///
    /// The document's id is read from its `_id` field; documents without
    /// one are rejected by returning `None` without storing.
    fn put(&self, collection: &str, document: Value) -> Option<Value>;

    /// Deletes a document, returning the removed version.
    fn delete(&self, collection: &str, document_id: &str) -> Option<Value>;

    /// Runs a query: filter, then sort, then limit.
    fn query(&self, query: &Query) -> Vec<Value>;

    /// Number of documents in a collection.
    fn count(&self, collection: &str) -> usize;

    /// Applies a change record to the materialized state.
    fn apply(&self, record: &ChangeRecord) {
        match record.operation {
            ChangeOperation::Insert | ChangeOperation::Update => {
                if let Some(document) = &record.document {
                    self.put(&record.collection, document.clone());
                }
            }
            ChangeOperation::Delete => {
                self.delete(&record.collection, &record.document_id);
            }
        }
    }
}

/// Hash-map backed document store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, collection: &str, document_id: &str) -> Option<Value> {
        self.collections
            .read()
            .get(collection)?
            .get(document_id)
            .cloned()
    }

    fn put(&self, collection: &str, document: Value) -> Option<Value> {
        let id = document_id(&document)?.to_string();
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id, document)
    }

    fn delete(&self, collection: &str, document_id: &str) -> Option<Value> {
        self.collections
            .write()
            .get_mut(collection)?
            .remove(document_id)
    }

    fn query(&self, query: &Query) -> Vec<Value> {
        let collections = self.collections.read();
        let Some(documents) = collections.get(&query.collection) else {
            return Vec::new();
        };

        let mut results: Vec<Value> = documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();

        if let Some(clauses) = &query.sort {
            results.sort_by(|a, b| compare_documents(a, b, clauses));
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
