//! ArborDB - Embedded realtime hierarchical database
//!
//! ArborDB stores one JSON-like tree of typed values. Nodes are addressed by
//! slash separated paths (`users/alice/name`, `list[0]`), written with
//! overwrite or merge semantics, and observed through subscriptions and
//! indexes.
//!
//! # Quick Start
//!
//! ```
//! use arbordb::{Database, Value};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! // In-memory database with default settings
//! let db = Database::builder().open()?;
//!
//! db.set("users/alice", Value::object_from([("name", "Alice")])).await?;
//! db.transact("users/alice/visits", |visits| {
//!     let n = visits.and_then(|v| v.as_int()).unwrap_or(0);
//!     Some(Value::Int(n + 1))
//! })
//! .await?;
//!
//! assert_eq!(db.get("users/alice/visits").await?, Some(Value::Int(1)));
//! # Ok::<(), arbordb::ArborError>(())
//! # }).unwrap();
//! ```
//!
//! # Architecture
//!
//! - `arbor-core`: paths, values, node records and the inline codec
//! - `arbor-storage`: the record store seam and its in-memory implementation
//! - `arbor-concurrency`: the path lock manager
//! - `arbor-engine`: the database, write engine, cache and event dispatch

pub use arbor_concurrency::{ConflictPolicy, LockManager, LockStats, NodeLock, Tid};
pub use arbor_core::{ArborError, ArborResult, NodeInfo, NodePath, NodeType, PathSegment, Value};
pub use arbor_engine::*;
pub use arbor_storage::{MemoryStore, RecordStore, StoreTransaction};
