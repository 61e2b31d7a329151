//! Event and Index Dispatch Integration Tests
//!
//! Subscribers and indexes are notified after the write commits, on the
//! database's dispatch task, so assertions poll until the expected
//! deliveries arrive.

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{NodePath, Value};
use arbor_engine::{
    Database, EngineConfig, Event, EventType, IndexSink, MutationBatch, SinkError, SinkResult,
    SubscriptionSink, WriteMode, WriteOptions,
};
use arbor_storage::MemoryStore;
use parking_lot::Mutex;

fn open() -> Database {
    Database::open(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap()
}

fn path(s: &str) -> NodePath {
    s.parse().unwrap()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    batches: Mutex<Vec<MutationBatch>>,
    notifications: Mutex<Vec<(EventType, NodePath)>>,
}

impl SubscriptionSink for Recorder {
    fn on_event(&self, event: &Event) -> SinkResult {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn on_mutations(&self, batch: &MutationBatch) -> SinkResult {
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    fn on_notify(&self, event_type: EventType, _: &NodePath, path: &NodePath) -> SinkResult {
        self.notifications.lock().push((event_type, path.clone()));
        Ok(())
    }
}

struct Failing;

impl SubscriptionSink for Failing {
    fn on_event(&self, _: &Event) -> SinkResult {
        Err(SinkError::new("subscriber went away"))
    }
}

struct RecordingIndex {
    path: NodePath,
    updates: Mutex<Vec<(NodePath, Option<Value>, Option<Value>)>>,
}

impl IndexSink for RecordingIndex {
    fn path(&self) -> &NodePath {
        &self.path
    }

    fn handle_record_update(
        &self,
        path: &NodePath,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> SinkResult {
        self.updates
            .lock()
            .push((path.clone(), old.cloned(), new.cloned()));
        Ok(())
    }
}

/// Poll until `check` holds, failing after about half a second
async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ============================================================================
// Value and Child Events
// ============================================================================

#[tokio::test]
async fn test_value_event_carries_old_and_new() {
    let db = open();
    db.set("users/alice", Value::object_from([("name", "Alice")]))
        .await
        .unwrap();

    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("users/alice"), EventType::Value, sink.clone());

    db.update("users/alice", Value::object_from([("age", 30)]))
        .await
        .unwrap();
    wait_for(|| sink.events.lock().len() == 1).await;

    let event = sink.events.lock()[0].clone();
    assert_eq!(event.event_type, EventType::Value);
    assert_eq!(event.path, path("users/alice"));
    assert_eq!(
        event.old,
        Some(Value::object_from([("name", "Alice")]))
    );
    assert_eq!(
        event.new,
        Some(Value::object_from([
            ("age", Value::Int(30)),
            ("name", Value::from("Alice"))
        ]))
    );
    assert_eq!(event.context, serde_json::Value::Null);
}

#[tokio::test]
async fn test_child_added_and_removed() {
    let db = open();
    let added = Arc::new(Recorder::default());
    let removed = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("users"), EventType::ChildAdded, added.clone());
    db.subscriptions()
        .subscribe(path("users"), EventType::ChildRemoved, removed.clone());

    db.set("users/alice", Value::object_from([("name", "Alice")]))
        .await
        .unwrap();
    wait_for(|| added.events.lock().len() == 1).await;
    {
        let events = added.events.lock();
        assert_eq!(events[0].path, path("users/alice"));
        assert_eq!(events[0].old, None);
        assert!(events[0].new.is_some());
    }

    db.remove("users/alice").await.unwrap();
    wait_for(|| removed.events.lock().len() == 1).await;
    {
        let events = removed.events.lock();
        assert_eq!(events[0].path, path("users/alice"));
        assert_eq!(events[0].new, None);
    }
    assert_eq!(added.events.lock().len(), 1);
}

#[tokio::test]
async fn test_wildcard_subscription_expands_per_child() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("users/*/name"), EventType::Value, sink.clone());

    db.set(
        "users",
        Value::object_from([
            ("alice", Value::object_from([("name", "Alice")])),
            ("bob", Value::object_from([("name", "Bob")])),
        ]),
    )
    .await
    .unwrap();
    wait_for(|| sink.events.lock().len() == 2).await;

    let mut paths: Vec<String> = sink
        .events
        .lock()
        .iter()
        .map(|e| e.path.to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["users/alice/name", "users/bob/name"]);

    db.set("users/bob/name", "Robert").await.unwrap();
    wait_for(|| sink.events.lock().len() == 3).await;
    let last = sink.events.lock()[2].clone();
    assert_eq!(last.path, path("users/bob/name"));
    assert_eq!(last.old, Some(Value::from("Bob")));
    assert_eq!(last.new, Some(Value::from("Robert")));
}

#[tokio::test]
async fn test_write_context_is_delivered() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("status"), EventType::Value, sink.clone());

    db.write(
        path("status"),
        Value::from("online"),
        WriteMode::Overwrite,
        WriteOptions::new().with_context(serde_json::json!({ "source": "sync" })),
    )
    .await
    .unwrap();
    wait_for(|| sink.events.lock().len() == 1).await;

    assert_eq!(
        sink.events.lock()[0].context,
        serde_json::json!({ "source": "sync" })
    );
}

#[tokio::test]
async fn test_unrelated_write_delivers_nothing() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("users/alice"), EventType::Value, sink.clone());

    db.set("users/bob", Value::object_from([("name", "Bob")]))
        .await
        .unwrap();
    settle().await;
    assert!(sink.events.lock().is_empty());
}

#[tokio::test]
async fn test_unsubscribed_sink_stops_receiving() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    let id = db
        .subscriptions()
        .subscribe(path("counter"), EventType::Value, sink.clone());

    db.set("counter", 1).await.unwrap();
    wait_for(|| sink.events.lock().len() == 1).await;

    assert!(db.subscriptions().unsubscribe(id));
    db.set("counter", 2).await.unwrap();
    settle().await;
    assert_eq!(sink.events.lock().len(), 1);
}

// ============================================================================
// Mutations and Notify Events
// ============================================================================

#[tokio::test]
async fn test_mutations_batch_lists_leaf_changes() {
    let db = open();
    db.set(
        "doc",
        Value::object_from([("a", Value::Int(1)), ("b", Value::Int(2))]),
    )
    .await
    .unwrap();

    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("doc"), EventType::Mutations, sink.clone());

    db.update(
        "doc",
        Value::object_from([("a", Value::Int(10)), ("b", Value::Null)]),
    )
    .await
    .unwrap();
    wait_for(|| sink.batches.lock().len() == 1).await;

    let batch = sink.batches.lock()[0].clone();
    assert_eq!(batch.path, path("doc"));
    let mut changed: Vec<String> = batch.mutations.iter().map(|m| m.path.to_string()).collect();
    changed.sort();
    assert_eq!(changed, vec!["doc/a", "doc/b"]);
}

#[tokio::test]
async fn test_notify_event_carries_path_only() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("flags"), EventType::NotifyValue, sink.clone());

    db.set("flags/dark_mode", true).await.unwrap();
    wait_for(|| sink.notifications.lock().len() == 1).await;

    assert_eq!(
        sink.notifications.lock()[0],
        (EventType::NotifyValue, path("flags"))
    );
    assert!(sink.events.lock().is_empty());
}

// ============================================================================
// Delivery Order
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_back_to_back_writes_arrive_in_order() {
    let db = open();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("counter"), EventType::Value, sink.clone());

    for n in 0..50i64 {
        db.set("counter", n).await.unwrap();
    }
    wait_for(|| sink.events.lock().len() == 50).await;

    let seen: Vec<Option<Value>> = sink.events.lock().iter().map(|e| e.new.clone()).collect();
    let expected: Vec<Option<Value>> = (0..50i64).map(|n| Some(Value::Int(n))).collect();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_events_form_a_chain() {
    let db = open();
    db.set("counter", -1).await.unwrap();
    let sink = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("counter"), EventType::Value, sink.clone());

    let writers: Vec<_> = (0..4i64)
        .map(|w| {
            let db = db.clone();
            tokio::spawn(async move {
                for i in 0..25i64 {
                    db.set("counter", w * 100 + i).await.unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    wait_for(|| sink.events.lock().len() == 100).await;

    // Each event starts from the value the previous one left behind
    let events = sink.events.lock().clone();
    assert_eq!(events[0].old, Some(Value::Int(-1)));
    for pair in events.windows(2) {
        assert_eq!(pair[1].old, pair[0].new);
    }
    assert_eq!(events[99].new, db.get("counter").await.unwrap());
}

// ============================================================================
// Failure Isolation
// ============================================================================

#[tokio::test]
async fn test_failing_sink_does_not_fail_write() {
    let db = open();
    let healthy = Arc::new(Recorder::default());
    db.subscriptions()
        .subscribe(path("items"), EventType::Value, Arc::new(Failing));
    db.subscriptions()
        .subscribe(path("items"), EventType::Value, healthy.clone());

    db.set("items/one", 1).await.unwrap();
    wait_for(|| healthy.events.lock().len() == 1).await;
    assert_eq!(db.get("items/one").await.unwrap(), Some(Value::Int(1)));
}

// ============================================================================
// Indexes
// ============================================================================

#[tokio::test]
async fn test_index_sees_record_lifecycle() {
    let db = open();
    let index = Arc::new(RecordingIndex {
        path: path("users"),
        updates: Mutex::new(Vec::new()),
    });
    db.indexes().add(index.clone());

    db.set("users/alice", Value::object_from([("name", "Alice")]))
        .await
        .unwrap();
    wait_for(|| index.updates.lock().len() == 1).await;

    db.update("users/alice", Value::object_from([("name", "Alicia")]))
        .await
        .unwrap();
    wait_for(|| index.updates.lock().len() == 2).await;

    db.remove("users/alice").await.unwrap();
    wait_for(|| index.updates.lock().len() == 3).await;

    let updates = index.updates.lock();
    assert!(updates.iter().all(|(p, _, _)| *p == path("users/alice")));
    assert_eq!(updates[0].1, None);
    assert_eq!(
        updates[1].2,
        Some(Value::object_from([("name", "Alicia")]))
    );
    assert_eq!(
        updates[2].1,
        Some(Value::object_from([("name", "Alicia")]))
    );
    assert_eq!(updates[2].2, None);
}

#[tokio::test]
async fn test_index_ignores_unchanged_records() {
    let db = open();
    db.set("users/alice", Value::object_from([("name", "Alice")]))
        .await
        .unwrap();
    let index = Arc::new(RecordingIndex {
        path: path("users"),
        updates: Mutex::new(Vec::new()),
    });
    db.indexes().add(index.clone());

    db.set("users/bob", Value::object_from([("name", "Bob")]))
        .await
        .unwrap();
    wait_for(|| !index.updates.lock().is_empty()).await;
    settle().await;

    let updates = index.updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, path("users/bob"));
}
