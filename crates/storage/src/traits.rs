//! Record store abstraction
//!
//! The engine treats the backing store as a transactional map from
//! [`NodePath`] to [`NodeRecord`]. Physical layout (pages, files, tables)
//! is entirely the store's business.
//!
//! Thread safety: a [`RecordStore`] is shared by every task of a database
//! and must be `Send + Sync`. Transactions are used by one task at a time.

use arbor_core::{ArborResult, NodePath, NodeRecord};

/// Predicate applied to candidate paths during enumeration
pub type PathFilter<'a> = &'a dyn Fn(&NodePath) -> bool;

/// Pluggable transactional record store
///
/// # Examples
///
/// ```
/// use arbor_storage::{MemoryStore, RecordStore};
///
/// let store = MemoryStore::new();
/// let txn = store.begin().unwrap();
/// txn.commit().unwrap();
/// ```
pub trait RecordStore: Send + Sync {
    /// Start a transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot open a transaction.
    fn begin(&self) -> ArborResult<Box<dyn StoreTransaction + '_>>;
}

/// One transaction against a [`RecordStore`]
///
/// Writes become visible to other transactions only on [`commit`]. If
/// [`rollback`] is called (or the transaction is dropped) nothing is applied.
///
/// [`commit`]: StoreTransaction::commit
/// [`rollback`]: StoreTransaction::rollback
pub trait StoreTransaction: Send {
    /// Record stored at `path`, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    fn get(&self, path: &NodePath) -> ArborResult<Option<NodeRecord>>;

    /// Create or replace the record at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or staged.
    fn set(&mut self, path: &NodePath, record: &NodeRecord) -> ArborResult<()>;

    /// Remove the record at `path` (no-op if absent)
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be staged.
    fn remove(&mut self, path: &NodePath) -> ArborResult<()>;

    /// Records of direct children of `path`, ordered by path
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails.
    fn children_of(
        &self,
        path: &NodePath,
        filter: Option<PathFilter<'_>>,
    ) -> ArborResult<Vec<(NodePath, NodeRecord)>>;

    /// Records of all descendants of `path` (not `path` itself), ordered by path
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails.
    fn descendants_of(
        &self,
        path: &NodePath,
        filter: Option<PathFilter<'_>>,
    ) -> ArborResult<Vec<(NodePath, NodeRecord)>>;

    /// Apply all staged writes atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the writes cannot be applied; nothing is applied then.
    fn commit(self: Box<Self>) -> ArborResult<()>;

    /// Discard all staged writes
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to release transaction resources.
    fn rollback(self: Box<Self>, reason: &str) -> ArborResult<()>;
}
