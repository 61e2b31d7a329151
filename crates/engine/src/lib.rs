//! Database engine for arbor
//!
//! This crate orchestrates all lower layers:
//! - Database: entry point wiring store, locks, cache and registries
//! - Write engine: merge/overwrite, inline vs. dedicated records, revisions
//! - Node reader: node info, values and children
//! - Optimistic transactions with retry
//! - Change tracker: structural diffs and mutation lists
//! - Event and index dispatch to external collaborators
//!
//! The engine is the only component that knows about:
//! - Bubbling writes to the record that stores a node
//! - Cache maintenance around store commits
//! - Which subtree must be loaded to notify subscribers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod database;
pub mod diff;
pub mod events;
mod reader;
mod writer;

pub use cache::{CacheLookup, CacheStats, NodeInfoCache};
pub use database::{
    Database, DatabaseBuilder, EngineConfig, RetryConfig, TransactionResult, CONFIG_FILE_NAME,
};
pub use diff::{compare_values, get_mutations, ChangeSet, ChildChange, Mutation, ValueCompareResult};
pub use events::{
    top_event_path, Event, EventType, IndexId, IndexRegistry, IndexSink, MutationBatch, SinkError,
    SinkResult, SubscriptionId, SubscriptionRegistry, SubscriptionSink, UnknownEventType,
};
pub use reader::Checkpoint;
pub use writer::{WriteMode, WriteOptions};
