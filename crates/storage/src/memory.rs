//! MemoryStore: in-memory record store with BTreeMap and staged transactions
//!
//! This module implements the [`RecordStore`] trait using:
//! - `BTreeMap<NodePath, Vec<u8>>` holding encoded records in path order
//! - `parking_lot::RwLock` for thread-safe access
//! - A per-transaction overlay of staged writes, applied under one write
//!   lock on commit
//!
//! # Design Notes
//!
//! - **Encoded records**: records are kept as MessagePack bytes, so every
//!   read goes through the same decode path a persistent store would use.
//! - **No conflict detection**: the lock manager already serializes
//!   writers; the store only guarantees all-or-nothing commits.
//! - **Subtree scans**: path order keeps a subtree contiguous, so
//!   descendants are a single range scan.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::{ArborError, ArborResult, NodePath, NodeRecord};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::traits::{PathFilter, RecordStore, StoreTransaction};

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Committed records, ordered by path
    data: Arc<RwLock<BTreeMap<NodePath, Vec<u8>>>>,
    /// Number of committed transactions
    commits: AtomicU64,
    /// Remaining successful `set` calls before failures are injected
    fail_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of committed transactions
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Paths of all committed records, in order
    pub fn paths(&self) -> Vec<NodePath> {
        self.data.read().keys().cloned().collect()
    }

    /// Let the next `n` `set` calls succeed, then fail every later one
    ///
    /// Used to exercise rollback paths.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        *self.fail_after.lock() = None;
    }

    fn check_injected_failure(&self, path: &NodePath) -> ArborResult<()> {
        let mut remaining = self.fail_after.lock();
        match remaining.as_mut() {
            Some(0) => Err(ArborError::Store(format!(
                "injected failure writing /{}",
                path
            ))),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl RecordStore for MemoryStore {
    fn begin(&self) -> ArborResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged: BTreeMap::new(),
        }))
    }
}

/// Transaction over a [`MemoryStore`]
///
/// `staged` maps a path to its new encoded record, or `None` for removal.
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    staged: BTreeMap<NodePath, Option<Vec<u8>>>,
}

impl MemoryTransaction<'_> {
    /// Encoded descendants of `path` as seen by this transaction
    fn subtree(&self, path: &NodePath) -> BTreeMap<NodePath, Vec<u8>> {
        let lower = Bound::Excluded(path.clone());
        let mut merged: BTreeMap<NodePath, Vec<u8>> = {
            let data = self.store.data.read();
            data.range((lower.clone(), Bound::Unbounded))
                .take_while(|(k, _)| path.is_ancestor_of(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (k, staged) in self
            .staged
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| path.is_ancestor_of(k))
        {
            match staged {
                Some(bytes) => {
                    merged.insert(k.clone(), bytes.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        merged
    }

    fn decode_all(
        entries: impl Iterator<Item = (NodePath, Vec<u8>)>,
        filter: Option<PathFilter<'_>>,
    ) -> ArborResult<Vec<(NodePath, NodeRecord)>> {
        entries
            .filter(|(k, _)| filter.map_or(true, |f| f(k)))
            .map(|(k, bytes)| Ok((k, NodeRecord::decode(&bytes)?)))
            .collect()
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get(&self, path: &NodePath) -> ArborResult<Option<NodeRecord>> {
        if let Some(staged) = self.staged.get(path) {
            return staged.as_deref().map(NodeRecord::decode).transpose();
        }
        let data = self.store.data.read();
        data.get(path).map(|bytes| NodeRecord::decode(bytes)).transpose()
    }

    fn set(&mut self, path: &NodePath, record: &NodeRecord) -> ArborResult<()> {
        self.store.check_injected_failure(path)?;
        self.staged.insert(path.clone(), Some(record.encode()?));
        Ok(())
    }

    fn remove(&mut self, path: &NodePath) -> ArborResult<()> {
        self.staged.insert(path.clone(), None);
        Ok(())
    }

    fn children_of(
        &self,
        path: &NodePath,
        filter: Option<PathFilter<'_>>,
    ) -> ArborResult<Vec<(NodePath, NodeRecord)>> {
        let children = self
            .subtree(path)
            .into_iter()
            .filter(|(k, _)| k.is_child_of(path));
        Self::decode_all(children, filter)
    }

    fn descendants_of(
        &self,
        path: &NodePath,
        filter: Option<PathFilter<'_>>,
    ) -> ArborResult<Vec<(NodePath, NodeRecord)>> {
        Self::decode_all(self.subtree(path).into_iter(), filter)
    }

    fn commit(self: Box<Self>) -> ArborResult<()> {
        let MemoryTransaction { store, staged } = *self;
        if staged.is_empty() {
            return Ok(());
        }
        let writes = staged.len();
        {
            let mut data = store.data.write();
            for (path, entry) in staged {
                match entry {
                    Some(bytes) => {
                        data.insert(path, bytes);
                    }
                    None => {
                        data.remove(&path);
                    }
                }
            }
        }
        store.commits.fetch_add(1, Ordering::Relaxed);
        debug!(target: "arbor::store", writes, "Memory transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>, reason: &str) -> ArborResult<()> {
        debug!(
            target: "arbor::store",
            discarded = self.staged.len(),
            reason,
            "Memory transaction rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{NodeType, RecordValue, StoredValue};

    fn p(s: &str) -> NodePath {
        s.parse().unwrap()
    }

    fn scalar(s: &str) -> NodeRecord {
        NodeRecord::create(
            NodeType::String,
            RecordValue::Scalar(StoredValue::String(s.to_string())),
            1,
        )
    }

    fn text(record: &NodeRecord) -> &str {
        match &record.value {
            RecordValue::Scalar(StoredValue::String(s)) => s,
            _ => panic!("not a string record"),
        }
    }

    #[test]
    fn test_staged_writes_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.set(&p("a"), &scalar("x")).unwrap();
        assert!(txn.get(&p("a")).unwrap().is_some());

        let other = store.begin().unwrap();
        assert!(other.get(&p("a")).unwrap().is_none());
        assert!(store.is_empty());

        txn.commit().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_rollback_discards() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.set(&p("a"), &scalar("x")).unwrap();
        txn.rollback("test").unwrap();
        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_remove_shadows_committed_record() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.set(&p("a"), &scalar("x")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        txn.remove(&p("a")).unwrap();
        assert!(txn.get(&p("a")).unwrap().is_none());
        txn.commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_descendants_merge_overlay() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        for path in ["a", "a/b", "a/b/c", "a/d", "ab", "b"] {
            txn.set(&p(path), &scalar(path)).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        txn.remove(&p("a/d")).unwrap();
        txn.set(&p("a/e"), &scalar("new")).unwrap();
        txn.set(&p("a/b"), &scalar("changed")).unwrap();

        let descendants = txn.descendants_of(&p("a"), None).unwrap();
        let paths: Vec<_> = descendants.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(paths, vec!["a/b", "a/b/c", "a/e"]);
        assert_eq!(text(&descendants[0].1), "changed");

        let children = txn.children_of(&p("a"), None).unwrap();
        let paths: Vec<_> = children.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(paths, vec!["a/b", "a/e"]);
    }

    #[test]
    fn test_enumeration_filter() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        for path in ["list", "list[0]", "list[1]", "list[2]"] {
            txn.set(&p(path), &scalar(path)).unwrap();
        }
        let odd = |path: &NodePath| {
            path.last_segment()
                .and_then(|s| s.as_index())
                .map_or(false, |i| i % 2 == 1)
        };
        let children = txn.children_of(&p("list"), Some(&odd)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, p("list[1]"));
    }

    #[test]
    fn test_root_descendants_cover_everything() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.set(&NodePath::root(), &scalar("root")).unwrap();
        txn.set(&p("x"), &scalar("x")).unwrap();
        txn.set(&p("y/z"), &scalar("z")).unwrap();
        let all = txn.descendants_of(&NodePath::root(), None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_after(1);
        let mut txn = store.begin().unwrap();
        assert!(txn.set(&p("a"), &scalar("a")).is_ok());
        let err = txn.set(&p("b"), &scalar("b")).unwrap_err();
        assert!(matches!(err, ArborError::Store(_)));
        txn.rollback("injected").unwrap();

        store.clear_failures();
        let mut txn = store.begin().unwrap();
        assert!(txn.set(&p("b"), &scalar("b")).is_ok());
    }
}
