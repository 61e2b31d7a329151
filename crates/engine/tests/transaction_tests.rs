//! Optimistic Transaction Integration Tests
//!
//! Validates `transact` and checkpoint assertions:
//! - Commit, cancel and remove outcomes
//! - Conflict detection on inline and dedicated nodes
//! - NaN values compare equal to themselves in checkpoints
//! - Retry after a concurrent write
//! - Concurrent increments never lose an update

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arbor_core::{ArborError, NodePath, PathSegment, Value};
use arbor_engine::{
    Database, EngineConfig, RetryConfig, TransactionResult, WriteMode, WriteOptions,
};
use arbor_storage::MemoryStore;

fn open_with(config: EngineConfig) -> Database {
    Database::open(Arc::new(MemoryStore::new()), config).unwrap()
}

fn open() -> Database {
    open_with(EngineConfig::default())
}

fn increment(current: Option<Value>) -> Option<Value> {
    let n = current.and_then(|v| v.as_int()).unwrap_or(0);
    Some(Value::Int(n + 1))
}

/// Write from another runtime while the calling task is blocked
fn write_elsewhere(db: &Database, path: &'static str, value: i64) {
    let db = db.clone();
    std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(db.set(path, value))
            .unwrap();
    })
    .join()
    .unwrap();
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_transact_commits() {
    let db = open();
    db.set("counter", 41).await.unwrap();

    let result = db.transact("counter", increment).await.unwrap();
    assert!(result.is_committed());
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(42)));
}

#[tokio::test]
async fn test_transact_on_missing_node() {
    let db = open();
    let result = db
        .transact("fresh/counter", |current| {
            assert!(current.is_none());
            Some(Value::Int(1))
        })
        .await
        .unwrap();

    match result {
        TransactionResult::Committed(info) => {
            assert!(info.exists);
            assert_eq!(info.value, Some(Value::Int(1)));
        }
        TransactionResult::Cancelled => panic!("expected commit"),
    }
}

#[tokio::test]
async fn test_transact_cancel_writes_nothing() {
    let db = open();
    db.set("counter", 5).await.unwrap();
    let root_before = db.get_node_info("").await.unwrap();

    let result = db.transact("counter", |_| None).await.unwrap();
    assert_eq!(result, TransactionResult::Cancelled);
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(5)));

    let root_after = db.get_node_info("").await.unwrap();
    assert_eq!(root_after.revision_nr, root_before.revision_nr);
}

#[tokio::test]
async fn test_transact_null_removes() {
    let db = open();
    db.set("doc", Value::object_from([("a", 1), ("b", 2)]))
        .await
        .unwrap();

    let result = db.transact("doc", |_| Some(Value::Null)).await.unwrap();
    assert!(result.is_committed());
    assert_eq!(db.get("doc").await.unwrap(), None);
}

// ============================================================================
// Conflict Detection
// ============================================================================

#[tokio::test]
async fn test_stale_checkpoint_conflicts() {
    let db = open();
    db.set("counter", 1).await.unwrap();
    let checkpoint = db.checkpoint("counter").await.unwrap();
    assert_eq!(checkpoint.holder(), &NodePath::root());
    assert_eq!(checkpoint.value(), Some(&Value::Int(1)));

    db.set("counter", 5).await.unwrap();

    let err = db
        .write(
            "counter".parse().unwrap(),
            Value::Int(2),
            WriteMode::Overwrite,
            WriteOptions::new().with_assert(checkpoint),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{}", err);
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(5)));
}

#[tokio::test]
async fn test_fresh_checkpoint_passes() {
    let db = open();
    db.set("counter", 1).await.unwrap();
    let checkpoint = db.checkpoint("counter").await.unwrap();

    db.write(
        "counter".parse().unwrap(),
        Value::Int(2),
        WriteMode::Overwrite,
        WriteOptions::new().with_assert(checkpoint),
    )
    .await
    .unwrap();
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(2)));
}

#[tokio::test]
async fn test_change_in_dedicated_descendant_conflicts() {
    let db = open();
    db.set(
        "doc",
        Value::object_from([("sub", Value::object_from([("x", 1)]))]),
    )
    .await
    .unwrap();
    let checkpoint = db.checkpoint("doc").await.unwrap();
    assert_eq!(checkpoint.holder(), &"doc".parse::<NodePath>().unwrap());

    // Only the record of doc/sub changes
    db.set("doc/sub/x", 2).await.unwrap();

    let err = db
        .write(
            "doc".parse().unwrap(),
            Value::object_from([("replaced", true)]),
            WriteMode::Overwrite,
            WriteOptions::new().with_assert(checkpoint),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ArborError::RevisionConflict { .. }));
}

#[tokio::test]
async fn test_nan_value_does_not_conflict_with_itself() {
    let db = open_with(EngineConfig::new().with_transaction_retries(RetryConfig::no_retry()));
    db.set("m", Value::object_from([("x", Value::Float(f64::NAN)), ("n", Value::Int(0))]))
        .await
        .unwrap();
    assert_eq!(
        db.checkpoint("m").await.unwrap(),
        db.checkpoint("m").await.unwrap()
    );

    let calls = AtomicUsize::new(0);
    let result = db
        .transact("m", |current| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut value = current?;
            if let Value::Object(map) = &mut value {
                map.insert("n".to_string(), Value::Int(1));
            }
            Some(value)
        })
        .await
        .unwrap();

    assert!(result.is_committed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = db.get("m").await.unwrap().unwrap();
    assert_eq!(stored.child(&PathSegment::from_key("n")), Some(&Value::Int(1)));
    assert!(matches!(stored.child(&PathSegment::from_key("x")), Some(Value::Float(f)) if f.is_nan()));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_transact_retries_after_concurrent_write() {
    let db = open();
    db.set("counter", 0).await.unwrap();
    let calls = AtomicUsize::new(0);

    let result = db
        .transact("counter", |current| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                write_elsewhere(&db, "counter", 100);
            }
            increment(current)
        })
        .await
        .unwrap();

    assert!(result.is_committed());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(101)));
}

#[tokio::test]
async fn test_conflict_surfaces_without_retries() {
    let db = open_with(EngineConfig::new().with_transaction_retries(RetryConfig::no_retry()));
    db.set("counter", 0).await.unwrap();

    let err = db
        .transact("counter", |current| {
            write_elsewhere(&db, "counter", 100);
            increment(current)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ArborError::RevisionConflict { .. }), "{}", err);
    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(100)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let retries = RetryConfig::new().with_max_retries(200).with_max_delay_ms(5);
    let db = open_with(EngineConfig::new().with_transaction_retries(retries));
    db.set("counter", 0).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                db.transact("counter", increment).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.get("counter").await.unwrap(), Some(Value::Int(80)));
    let stats = db.lock_manager().stats();
    assert_eq!(stats.locked + stats.pending, 0);
}
