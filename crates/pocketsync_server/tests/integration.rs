//! End-to-end protocol tests.
//!
//! These drive [`SyncSession`]s directly against a shared
//! [`ServerContext`], with outbound queues attached to the router the
//! same way connection tasks attach them. Batch windows are flushed
//! explicitly so the tests stay deterministic.

use pocketsync_core::{LastWriteWins, MemoryDocumentStore};
use pocketsync_protocol::{
    ChangeRecord, Checkpoint, Envelope, Payload, Pull, Push, Query, Subscribe, PROTOCOL_VERSION,
};
use pocketsync_server::{AllowAll, ServerConfig, ServerContext, SessionEvent, SyncSession};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn context() -> Arc<ServerContext> {
    ServerContext::new(
        ServerConfig::default(),
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(AllowAll),
        Arc::new(LastWriteWins),
    )
}

fn encode(payload: Payload) -> String {
    Envelope::new(payload).encode().unwrap()
}

fn reply(events: Vec<SessionEvent>) -> Envelope {
    assert_eq!(events.len(), 1, "expected exactly one reply: {events:?}");
    match events.into_iter().next().unwrap() {
        SessionEvent::Reply(envelope) => envelope,
        other => panic!("expected reply, got {other:?}"),
    }
}

/// Opens a handshaken session with an outbound queue on the router.
fn connect(
    context: &Arc<ServerContext>,
    node_id: &str,
) -> (SyncSession, mpsc::Receiver<Envelope>) {
    let mut session = SyncSession::new(context.clone(), None);
    let (tx, rx) = mpsc::channel(64);
    context.router.attach(session.client_id(), tx);

    let raw = encode(Payload::Handshake(pocketsync_protocol::Handshake {
        node_id: node_id.into(),
        collections: vec!["todos".into()],
        capabilities: vec!["live-queries".into()],
        protocol_version: PROTOCOL_VERSION,
    }));
    let ack = reply(session.handle_message(&raw));
    assert_eq!(ack.message_type(), "handshake-ack");
    (session, rx)
}

fn subscribe_all(session: &mut SyncSession, collection: &str) -> String {
    let raw = encode(Payload::Subscribe(Subscribe {
        query: Query::all(collection),
    }));
    match reply(session.handle_message(&raw)).payload {
        Payload::SubscribeAck(ack) => ack.subscription_id,
        other => panic!("expected subscribe-ack, got {other:?}"),
    }
}

fn push(session: &mut SyncSession, changes: Vec<ChangeRecord>, checkpoint: Checkpoint) -> Envelope {
    let raw = encode(Payload::Push(Push {
        collection: "todos".into(),
        changes,
        checkpoint,
    }));
    reply(session.handle_message(&raw))
}

fn insert(id: &str, timestamp: u64) -> ChangeRecord {
    ChangeRecord::insert(
        "todos",
        id,
        json!({"_id": id, "title": format!("task {id}"), "done": false}),
        timestamp,
        "node-b",
    )
}

#[tokio::test]
async fn live_query_sees_other_clients_push() {
    let context = context();
    let (mut subscriber, mut updates) = connect(&context, "node-a");
    let (mut writer, _writer_rx) = connect(&context, "node-b");

    let subscription_id = subscribe_all(&mut subscriber, "todos");

    let response = push(&mut writer, vec![insert("t1", 10)], Checkpoint::new("node-b", 1));
    assert_eq!(response.message_type(), "push-response");

    context.batcher.flush(&subscription_id);
    let envelope = updates.recv().await.unwrap();
    match envelope.payload {
        Payload::SubscriptionUpdate(update) => {
            assert_eq!(update.delta.subscription_id, subscription_id);
            assert_eq!(update.delta.added.len(), 1);
            assert_eq!(update.delta.added[0]["_id"], "t1");
            assert_eq!(update.delta.sequence, 1);
        }
        other => panic!("expected subscription-update, got {other:?}"),
    }
}

#[tokio::test]
async fn pusher_does_not_hear_its_own_change() {
    let context = context();
    let (mut client, mut updates) = connect(&context, "node-a");

    let subscription_id = subscribe_all(&mut client, "todos");
    push(&mut client, vec![insert("t1", 10)], Checkpoint::new("node-a", 1));

    context.batcher.flush(&subscription_id);
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn insert_then_delete_coalesces_to_nothing() {
    let context = context();
    let (mut subscriber, mut updates) = connect(&context, "node-a");
    let (mut writer, _writer_rx) = connect(&context, "node-b");

    let subscription_id = subscribe_all(&mut subscriber, "todos");

    let checkpoint = Checkpoint::new("node-b", 1);
    push(&mut writer, vec![insert("t1", 10)], checkpoint.clone());
    push(&mut writer, vec![insert("t2", 11)], checkpoint.clone());
    let mut seen = checkpoint;
    seen.advance("todos", context.log.current_sequence("todos"));
    push(
        &mut writer,
        vec![ChangeRecord::delete("todos", "t1", None, 12, "node-b")],
        seen,
    );

    context.batcher.flush(&subscription_id);
    let envelope = updates.recv().await.unwrap();
    match envelope.payload {
        Payload::SubscriptionUpdate(update) => {
            // t1's add and delete cancelled inside the window.
            assert_eq!(update.delta.added.len(), 1);
            assert_eq!(update.delta.added[0]["_id"], "t2");
            assert!(update.delta.removed.is_empty());
        }
        other => panic!("expected subscription-update, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_push_reports_conflict_and_newest_write_wins() {
    let context = context();
    let (mut first, _rx1) = connect(&context, "node-a");
    let (mut second, _rx2) = connect(&context, "node-b");

    // First writer establishes the document at sequence 1.
    push(&mut first, vec![insert("t1", 100)], Checkpoint::new("node-a", 1));

    // Second writer updates the same document without having seen it.
    let stale = ChangeRecord::update(
        "todos",
        "t1",
        json!({"_id": "t1", "title": "rewritten", "done": true}),
        None,
        200,
        "node-b",
    );
    let response = push(&mut second, vec![stale], Checkpoint::new("node-b", 2));

    match response.payload {
        Payload::PushResponse(response) => {
            assert!(!response.success);
            assert_eq!(response.conflicts.len(), 1);
            let conflict = &response.conflicts[0];
            assert_eq!(conflict.document_id, "t1");
            // The later timestamp wins under last-write-wins.
            assert_eq!(
                conflict.winner,
                pocketsync_protocol::ConflictWinner::Remote
            );
        }
        other => panic!("expected push-response, got {other:?}"),
    }
    let doc = context.store.get("todos", "t1").unwrap();
    assert_eq!(doc["title"], "rewritten");
}

#[tokio::test]
async fn up_to_date_push_is_conflict_free() {
    let context = context();
    let (mut first, _rx1) = connect(&context, "node-a");
    let (mut second, _rx2) = connect(&context, "node-b");

    push(&mut first, vec![insert("t1", 100)], Checkpoint::new("node-a", 1));

    let mut seen = Checkpoint::new("node-b", 2);
    seen.advance("todos", context.log.current_sequence("todos"));
    let update = ChangeRecord::update(
        "todos",
        "t1",
        json!({"_id": "t1", "title": "edited", "done": false}),
        None,
        200,
        "node-b",
    );
    let response = push(&mut second, vec![update], seen);

    match response.payload {
        Payload::PushResponse(response) => {
            assert!(response.success);
            assert!(response.conflicts.is_empty());
        }
        other => panic!("expected push-response, got {other:?}"),
    }
}

#[tokio::test]
async fn pull_pages_through_history() {
    let context = context();
    let (mut writer, _rx1) = connect(&context, "node-a");
    let checkpoint = Checkpoint::new("node-a", 1);
    for i in 0..5 {
        push(&mut writer, vec![insert(&format!("t{i}"), i)], checkpoint.clone());
    }

    let (mut reader, _rx2) = connect(&context, "node-b");
    let mut cursor = Checkpoint::new("node-b", 1);
    let mut total = 0;
    for _ in 0..3 {
        let raw = encode(Payload::Pull(Pull {
            collections: vec!["todos".into()],
            checkpoint: cursor.clone(),
            limit: Some(2),
        }));
        match reply(reader.handle_message(&raw)).payload {
            Payload::PullResponse(response) => {
                let records = &response.changes["todos"];
                total += records.len();
                // Records arrive in sequence order past the cursor.
                for pair in records.windows(2) {
                    assert!(pair[0].sequence < pair[1].sequence);
                }
                cursor = response.checkpoint;
                if total < 5 {
                    assert!(response.has_more);
                }
            }
            other => panic!("expected pull-response, got {other:?}"),
        }
    }
    assert_eq!(total, 5);
    assert_eq!(cursor.sequence_for("todos"), 5);
}

#[tokio::test]
async fn update_moving_document_out_of_filter_is_a_removal() {
    let context = context();
    let (mut subscriber, mut updates) = connect(&context, "node-a");
    let (mut writer, _writer_rx) = connect(&context, "node-b");

    // Subscribe to open todos only.
    let raw = encode(Payload::Subscribe(Subscribe {
        query: Query {
            collection: "todos".into(),
            filter: Some(pocketsync_protocol::FilterNode::Condition(
                pocketsync_protocol::FilterCondition {
                    field: "done".into(),
                    operator: "eq".into(),
                    value: json!(false),
                },
            )),
            sort: None,
            limit: None,
        },
    }));
    let subscription_id = match reply(subscriber.handle_message(&raw)).payload {
        Payload::SubscribeAck(ack) => ack.subscription_id,
        other => panic!("expected subscribe-ack, got {other:?}"),
    };

    push(&mut writer, vec![insert("t1", 10)], Checkpoint::new("node-b", 1));
    context.batcher.flush(&subscription_id);
    let envelope = updates.recv().await.unwrap();
    assert_eq!(envelope.message_type(), "subscription-update");

    // Completing the todo moves it out of the filter.
    let mut seen = Checkpoint::new("node-b", 2);
    seen.advance("todos", context.log.current_sequence("todos"));
    let done = ChangeRecord::update(
        "todos",
        "t1",
        json!({"_id": "t1", "title": "task t1", "done": true}),
        None,
        20,
        "node-b",
    );
    push(&mut writer, vec![done], seen);

    context.batcher.flush(&subscription_id);
    let envelope = updates.recv().await.unwrap();
    match envelope.payload {
        Payload::SubscriptionUpdate(update) => {
            assert_eq!(update.delta.removed, vec!["t1".to_string()]);
            assert!(update.delta.added.is_empty());
            assert!(update.delta.modified.is_empty());
        }
        other => panic!("expected subscription-update, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_subscriber_is_detached_not_blocking() {
    let context = context();
    let (mut subscriber, _updates) = connect(&context, "node-a");
    let (mut writer, _writer_rx) = connect(&context, "node-b");

    let subscription_id = subscribe_all(&mut subscriber, "todos");

    // Replace the subscriber's queue with a zero-headroom one and fill it.
    let (tx, _stuck_rx) = mpsc::channel(1);
    context.router.attach(subscriber.client_id(), tx);
    assert!(context
        .router
        .send(subscriber.client_id(), Envelope::new(Payload::Ping)));

    push(&mut writer, vec![insert("t1", 10)], Checkpoint::new("node-b", 1));
    context.batcher.flush(&subscription_id);

    // Delivery failed, so the router dropped the client and the batcher
    // discarded its windows. The writer is unaffected.
    assert_eq!(context.router.len(), 1);
    assert_eq!(context.batcher.pending_count(), 0);
}

#[tokio::test]
async fn checkpoint_registration_pins_compaction() {
    let context = context();
    let (mut writer, _rx) = connect(&context, "node-a");
    let checkpoint = Checkpoint::new("node-a", 1);
    for i in 0..3 {
        let record = ChangeRecord::update(
            "todos",
            "t1",
            json!({"_id": "t1", "v": i}),
            None,
            i,
            "node-a",
        );
        push(&mut writer, vec![record], checkpoint.clone());
    }

    // A peer stuck at sequence 2 registers its cursor.
    let mut behind = Checkpoint::new("node-c", 1);
    behind.advance("todos", 2);
    let raw = encode(Payload::Checkpoint(pocketsync_protocol::CheckpointMessage {
        session_id: "s1".into(),
        checkpoint: behind,
        collections: vec!["todos".into()],
    }));
    let ack = reply(writer.handle_message(&raw));
    assert_eq!(ack.message_type(), "checkpoint-ack");

    context.log.compact(u64::MAX);
    let remaining: Vec<u64> = context
        .log
        .get_for_collection("todos", 0, 10)
        .iter()
        .map(|r| r.sequence)
        .collect();
    assert_eq!(remaining, vec![2, 3]);
}

#[tokio::test]
async fn concurrent_pushers_cannot_reorder_a_subscriptions_deltas() {
    let context = ServerContext::new(
        ServerConfig::default().with_max_batch_size(1),
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(AllowAll),
        Arc::new(LastWriteWins),
    );

    let (tx, mut updates) = mpsc::channel(2048);
    context.router.attach("watcher", tx);
    let subscription_id = context
        .subscriptions
        .register("watcher", Query::all("todos"), Default::default())
        .unwrap()
        .id;

    let writers: Vec<_> = (0..2)
        .map(|writer| {
            let context = context.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..300 {
                    let id = format!("w{writer}-t{i}");
                    context.broadcast("pusher", &insert(&id, 1));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    // Batch size 1 flushes every delta straight through, so the wire
    // order is the enqueue order.
    let mut last = 0;
    for _ in 0..600 {
        let envelope = updates.recv().await.unwrap();
        let update = match envelope.payload {
            Payload::SubscriptionUpdate(update) => update,
            other => panic!("expected subscription-update, got {other:?}"),
        };
        assert_eq!(update.delta.subscription_id, subscription_id);
        assert!(
            update.delta.sequence > last,
            "delta sequence regressed: {last} then {}",
            update.delta.sequence
        );
        last = update.delta.sequence;
    }
    assert_eq!(last, 600);
}
