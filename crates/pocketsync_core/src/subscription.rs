//! Subscription registry and incremental delta computation.
//!
//! Each subscription tracks the set of document ids its client currently
//! holds for one live query. The delta computer maintains that set
//! incrementally from change events instead of re-running the query,
//! which is where the correctness burden lives: a change must map to
//! exactly one of added/removed/modified or to no delta at all, and a
//! null result must leave the subscription untouched so that replays
//! cannot corrupt state.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use pocketsync_protocol::{now_millis, ChangeOperation, ChangeRecord, Query, SubscriptionDelta};
use std::collections::{HashMap, HashSet};

/// State of one live query subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    /// Subscription id.
    pub id: String,
    /// The owning client connection.
    pub client_id: String,
    /// The registered query.
    pub query: Query,
    /// Ids the client currently holds for this query.
    pub current_ids: HashSet<String>,
    /// Per-subscription delivery counter, strictly increasing.
    pub sequence: u64,
}

#[derive(Default)]
struct SubscriptionInner {
    subscriptions: HashMap<String, SubscriptionState>,
    /// collection -> subscription ids over it.
    by_collection: HashMap<String, HashSet<String>>,
    /// client -> subscription ids it owns.
    by_client: HashMap<String, HashSet<String>>,
}

/// Registry of live query subscriptions.
pub struct SubscriptionRegistry {
    inner: RwLock<SubscriptionInner>,
    max_per_client: usize,
}

impl SubscriptionRegistry {
    /// Creates a registry enforcing the given per-client subscription cap.
    pub fn new(max_per_client: usize) -> Self {
        Self {
            inner: RwLock::new(SubscriptionInner::default()),
            max_per_client,
        }
    }

    /// Registers a live query for a client.
    ///
    /// `initial_ids` is the result set at subscription time; the delta
    /// computer evolves it from there. Fails with
    /// [`CoreError::SubscriptionLimit`] above the per-client cap.
    pub fn register(
        &self,
        client_id: &str,
        query: Query,
        initial_ids: HashSet<String>,
    ) -> CoreResult<SubscriptionState> {
        let mut inner = self.inner.write();

        let owned = inner
            .by_client
            .get(client_id)
            .map(HashSet::len)
            .unwrap_or(0);
        if owned >= self.max_per_client {
            return Err(CoreError::SubscriptionLimit {
                max: self.max_per_client,
            });
        }

        let state = SubscriptionState {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            query,
            current_ids: initial_ids,
            sequence: 0,
        };

        inner
            .by_collection
            .entry(state.query.collection.clone())
            .or_default()
            .insert(state.id.clone());
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(state.id.clone());
        inner
            .subscriptions
            .insert(state.id.clone(), state.clone());
        Ok(state)
    }

    /// Removes a subscription, returning it if present.
    pub fn unregister(&self, subscription_id: &str) -> Option<SubscriptionState> {
        let mut inner = self.inner.write();
        let state = inner.subscriptions.remove(subscription_id)?;

        if let Some(ids) = inner.by_collection.get_mut(&state.query.collection) {
            ids.remove(subscription_id);
            if ids.is_empty() {
                inner.by_collection.remove(&state.query.collection);
            }
        }
        if let Some(ids) = inner.by_client.get_mut(&state.client_id) {
            ids.remove(subscription_id);
            if ids.is_empty() {
                inner.by_client.remove(&state.client_id);
            }
        }
        Some(state)
    }

    /// Removes every subscription owned by a client, returning their ids.
    pub fn unregister_client(&self, client_id: &str) -> Vec<String> {
        let ids: Vec<String> = {
            let inner = self.inner.read();
            inner
                .by_client
                .get(client_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for id in &ids {
            self.unregister(id);
        }
        ids
    }

    /// Returns the subscriptions over a collection.
    pub fn subscriptions_for_collection(&self, collection: &str) -> Vec<SubscriptionState> {
        let inner = self.inner.read();
        inner
            .by_collection
            .get(collection)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.subscriptions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a subscription by id.
    pub fn get(&self, subscription_id: &str) -> Option<SubscriptionState> {
        self.inner.read().subscriptions.get(subscription_id).cloned()
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    /// Returns true if no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies one change event to one subscription.
    ///
    /// Returns the minimal delta, or `None` when the change does not
    /// affect the subscription's result set. `current_ids` and the
    /// delivery sequence are mutated only on a non-null result, so
    /// replaying a change that produced `None` can never corrupt state.
    ///
    /// A `limit` on the query never evicts another document on insert;
    /// the client re-applies sort+limit locally.
    pub fn compute_delta(
        &self,
        subscription_id: &str,
        change: &ChangeRecord,
    ) -> CoreResult<Option<SubscriptionDelta>> {
        let mut inner = self.inner.write();
        Self::apply_change(&mut inner, subscription_id, change)
    }

    /// Applies one change event to one subscription and hands any
    /// resulting delta to `deliver`, together with the owning client id,
    /// before the registry lock is released.
    ///
    /// Concurrent writers fanning out the same subscription must go
    /// through this entry point: the sequence is assigned and the delta
    /// handed off under one lock hold, so deltas reach the sink in
    /// sequence order. Returns whether a delta was delivered.
    pub fn notify<F>(&self, subscription_id: &str, change: &ChangeRecord, deliver: F) -> CoreResult<bool>
    where
        F: FnOnce(&str, SubscriptionDelta),
    {
        let mut inner = self.inner.write();
        let client_id = inner
            .subscriptions
            .get(subscription_id)
            .ok_or_else(|| CoreError::UnknownSubscription(subscription_id.to_string()))?
            .client_id
            .clone();
        match Self::apply_change(&mut inner, subscription_id, change)? {
            Some(delta) => {
                deliver(&client_id, delta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply_change(
        inner: &mut SubscriptionInner,
        subscription_id: &str,
        change: &ChangeRecord,
    ) -> CoreResult<Option<SubscriptionDelta>> {
        let state = inner
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| CoreError::UnknownSubscription(subscription_id.to_string()))?;

        if state.query.collection != change.collection {
            return Ok(None);
        }

        let was_in_set = state.current_ids.contains(&change.document_id);
        let matches_now = change
            .document
            .as_ref()
            .map(|doc| state.query.matches(doc))
            .unwrap_or(false);

        let mut delta =
            SubscriptionDelta::empty(state.id.clone(), state.sequence + 1, now_millis());

        match change.operation {
            ChangeOperation::Insert => {
                // An insert of an id the set already holds replays a
                // change the client has seen; emit nothing.
                if !matches_now || was_in_set {
                    return Ok(None);
                }
                if let Some(doc) = &change.document {
                    delta.added.push(doc.clone());
                }
                state.current_ids.insert(change.document_id.clone());
            }
            ChangeOperation::Update => match (was_in_set, matches_now) {
                (true, true) => {
                    if let Some(doc) = &change.document {
                        delta.modified.push(doc.clone());
                    }
                }
                (false, true) => {
                    if let Some(doc) = &change.document {
                        delta.added.push(doc.clone());
                    }
                    state.current_ids.insert(change.document_id.clone());
                }
                (true, false) => {
                    delta.removed.push(change.document_id.clone());
                    state.current_ids.remove(&change.document_id);
                }
                (false, false) => return Ok(None),
            },
            ChangeOperation::Delete => {
                if !was_in_set {
                    return Ok(None);
                }
                delta.removed.push(change.document_id.clone());
                state.current_ids.remove(&change.document_id);
            }
        }

        state.sequence += 1;
        Ok(Some(delta))
    }
}
