//! Database struct and open logic
//!
//! This module provides the main Database struct that wires together:
//! - the pluggable record store
//! - the lock manager
//! - the node info cache
//! - subscription and index registries
//!
//! ## Read and write API
//!
//! Every operation runs under its own transaction id:
//!
//! 1. **Reads** (`get`, `get_node_info`, `get_children`, `exists`) take a
//!    read lock on the path. Many reads run concurrently.
//! 2. **Writes** (`set`, `update`, `remove`, `write`) take a write lock,
//!    which excludes every other transaction while it is held.
//! 3. **Transactions** (`transact`) read, call back, and write asserting
//!    that the node did not change in between, retrying on conflict.

mod builder;
pub mod config;
mod transactions;

pub use builder::DatabaseBuilder;
pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use transactions::{RetryConfig, TransactionResult};

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_concurrency::LockManager;
use arbor_core::{
    now_millis, ArborResult, NodeInfo, NodePath, NodeRecord, NodeType, RecordValue, Value,
};
use arbor_storage::{RecordStore, StoreTransaction};
use tracing::{debug, info, warn};

use crate::cache::{wait_for_load, CacheLookup, NodeInfoCache};
use crate::events::{DispatchQueue, IndexRegistry, SubscriptionRegistry};
use crate::reader::{self, Checkpoint};
use crate::writer::{WriteMode, WriteOptions};

pub(crate) struct DatabaseInner {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) cache: NodeInfoCache,
    pub(crate) config: EngineConfig,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) indexes: IndexRegistry,
    pub(crate) dispatch: DispatchQueue,
}

/// Embedded hierarchical database
///
/// Cloning is cheap; clones share the same store, locks and cache.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use arbor_core::Value;
/// use arbor_engine::{Database, EngineConfig};
/// use arbor_storage::MemoryStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let db = Database::open(Arc::new(MemoryStore::new()), EngineConfig::default())?;
/// db.set("users/alice", Value::object_from([("name", "Alice")])).await?;
/// db.update("users/alice", Value::object_from([("age", 30)])).await?;
///
/// let alice = db.get("users/alice").await?.unwrap();
/// assert_eq!(alice, Value::object_from([("age", Value::Int(30)), ("name", Value::from("Alice"))]));
/// # Ok::<(), arbor_core::ArborError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Database {
    /// Open a database on `store`
    ///
    /// Creates the root record (an empty object) if the store has none.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration, or the store's
    /// error if the root record cannot be created.
    pub fn open(store: Arc<dyn RecordStore>, config: EngineConfig) -> ArborResult<Self> {
        let locks = Arc::new(LockManager::new(config.lock_timeout()));
        Self::open_with_locks(store, config, locks)
    }

    /// Start building a database
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn open_with_locks(
        store: Arc<dyn RecordStore>,
        config: EngineConfig,
        locks: Arc<LockManager>,
    ) -> ArborResult<Self> {
        config.validate()?;

        let root = NodePath::root();
        let mut txn = store.begin()?;
        if txn.get(&root)?.is_none() {
            let record = NodeRecord::create(
                NodeType::Object,
                RecordValue::Children(BTreeMap::new()),
                now_millis(),
            );
            txn.set(&root, &record)?;
            info!(target: "arbor::store", "Created root record");
        }
        txn.commit()?;

        let cache = if config.cache_enabled {
            NodeInfoCache::new(config.cache_ttl())
        } else {
            NodeInfoCache::disabled()
        };
        info!(
            target: "arbor::store",
            cache_enabled = config.cache_enabled,
            max_inline_value_size = config.max_inline_value_size,
            "Database opened"
        );

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                store,
                locks,
                cache,
                config,
                subscriptions: SubscriptionRegistry::new(),
                indexes: IndexRegistry::new(),
                dispatch: DispatchQueue::new(),
            }),
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replace the node at `path`
    pub async fn set(&self, path: &str, value: impl Into<Value>) -> ArborResult<NodeInfo> {
        let path = NodePath::concrete(path)?;
        self.write(path, value.into(), WriteMode::Overwrite, WriteOptions::new())
            .await
    }

    /// Merge the properties of `value` into the node at `path`
    ///
    /// Properties set to `Null` are removed; all others are left untouched.
    pub async fn update(&self, path: &str, value: impl Into<Value>) -> ArborResult<NodeInfo> {
        let path = NodePath::concrete(path)?;
        self.write(path, value.into(), WriteMode::Merge, WriteOptions::new())
            .await
    }

    /// Remove the node at `path` and everything below it
    pub async fn remove(&self, path: &str) -> ArborResult<NodeInfo> {
        let path = NodePath::concrete(path)?;
        self.write(path, Value::Null, WriteMode::Overwrite, WriteOptions::new())
            .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Value of the node at `path`, or `None` if it does not exist
    pub async fn get(&self, path: &str) -> ArborResult<Option<Value>> {
        let path = NodePath::concrete(path)?;
        self.read(&path, |txn| reader::load_value(txn, &path)).await
    }

    /// Metadata of the node at `path`
    ///
    /// Served from the node info cache when possible.
    pub async fn get_node_info(&self, path: &str) -> ArborResult<NodeInfo> {
        let path = NodePath::concrete(path)?;
        self.node_info(&path).await
    }

    /// Direct children of the node at `path`, in key order
    pub async fn get_children(&self, path: &str, include_values: bool) -> ArborResult<Vec<NodeInfo>> {
        let path = NodePath::concrete(path)?;
        self.read(&path, |txn| reader::load_children(txn, &path, include_values))
            .await
    }

    /// Check whether a node exists at `path`
    pub async fn exists(&self, path: &str) -> ArborResult<bool> {
        Ok(self.get_node_info(path).await?.exists)
    }

    /// Capture the current state of the node at `path`
    ///
    /// Pass it to [`WriteOptions::with_assert`] to make a later write fail
    /// if the node changed in the meantime.
    pub async fn checkpoint(&self, path: &str) -> ArborResult<Checkpoint> {
        let path = NodePath::concrete(path)?;
        self.checkpoint_at(&path).await
    }

    pub(crate) async fn checkpoint_at(&self, path: &NodePath) -> ArborResult<Checkpoint> {
        self.read(path, |txn| reader::read_checkpoint(txn, path)).await
    }

    async fn node_info(&self, path: &NodePath) -> ArborResult<NodeInfo> {
        let cache = &self.inner.cache;
        match cache.find(path) {
            CacheLookup::Hit(info) => return Ok(info),
            CacheLookup::Pending(receiver) => {
                if let Some(info) = wait_for_load(receiver).await {
                    return Ok(info);
                }
            }
            CacheLookup::Miss => {}
        }

        let ticket = cache.begin_load(path);
        let tid = self.inner.locks.next_tid();
        let lock = self.inner.locks.lock(path.clone(), tid, false).await?;
        let info = self.with_store(|txn| reader::load_node_info(txn, path))?;
        // Publish while the read lock still excludes writers.
        if let Some(ticket) = ticket {
            ticket.finish(&info);
        }
        lock.release()?;
        Ok(info)
    }

    /// Run a read-only closure under a read lock on `path`
    async fn read<T>(
        &self,
        path: &NodePath,
        f: impl FnOnce(&dyn StoreTransaction) -> ArborResult<T>,
    ) -> ArborResult<T> {
        let tid = self.inner.locks.next_tid();
        let lock = self.inner.locks.lock(path.clone(), tid, false).await?;
        debug!(target: "arbor::store", tid = %tid, path = %path, "Read");
        let result = self.with_store(f)?;
        lock.release()?;
        Ok(result)
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&dyn StoreTransaction) -> ArborResult<T>,
    ) -> ArborResult<T> {
        let txn = self.inner.store.begin()?;
        match f(&*txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback(&e.to_string()) {
                    warn!(target: "arbor::store", error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Subscriptions notified of changes
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    /// Indexes updated on changes
    pub fn indexes(&self) -> &IndexRegistry {
        &self.inner.indexes
    }

    /// Lock manager shared by all operations
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.inner.locks
    }

    /// Node info cache
    pub fn cache(&self) -> &NodeInfoCache {
        &self.inner.cache
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}
