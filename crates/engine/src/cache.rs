//! Node info cache
//!
//! Time-boxed cache of [`NodeInfo`] keyed by path. Entries expire after the
//! configured TTL, which is refreshed on every hit (keep-alive).
//!
//! While one reader loads a path from the store, the entry is `Loading`;
//! concurrent readers of the same path get a [`CacheLookup::Pending`]
//! receiver and wait for that load instead of repeating it.
//!
//! The cache is a pure optimization. A disabled cache misses every lookup
//! and ignores every update, and the engine behaves identically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arbor_core::{NodeInfo, NodePath};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

/// Result of a cache lookup
#[derive(Debug)]
pub enum CacheLookup {
    /// Cached, unexpired entry
    Hit(NodeInfo),
    /// Another reader is loading this path
    Pending(watch::Receiver<Option<NodeInfo>>),
    /// Not cached
    Miss,
}

enum Slot {
    Ready {
        info: NodeInfo,
        expires_at: Instant,
    },
    Loading {
        load_id: u64,
        sender: watch::Sender<Option<NodeInfo>>,
    },
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that had to go to the store
    pub misses: u64,
}

/// Node info cache
pub struct NodeInfoCache {
    entries: DashMap<NodePath, Slot>,
    ttl: Duration,
    enabled: bool,
    next_load_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for NodeInfoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInfoCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl NodeInfoCache {
    /// Create an enabled cache
    pub fn new(ttl: Duration) -> Self {
        NodeInfoCache {
            entries: DashMap::new(),
            ttl,
            enabled: true,
            next_load_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache that never stores anything
    pub fn disabled() -> Self {
        NodeInfoCache {
            enabled: false,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Whether the cache stores entries
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of entries (ready or loading)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Look up a path, refreshing the entry's keep-alive on a hit
    pub fn find(&self, path: &NodePath) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }
        let now = Instant::now();
        let mut expired = false;
        let lookup = match self.entries.get_mut(path) {
            Some(mut slot) => match &mut *slot {
                Slot::Ready { info, expires_at } if *expires_at > now => {
                    *expires_at = now + self.ttl;
                    CacheLookup::Hit(info.clone())
                }
                Slot::Ready { .. } => {
                    expired = true;
                    CacheLookup::Miss
                }
                Slot::Loading { sender, .. } => CacheLookup::Pending(sender.subscribe()),
            },
            None => CacheLookup::Miss,
        };
        if expired {
            self.entries
                .remove_if(path, |_, slot| matches!(slot, Slot::Ready { expires_at, .. } if *expires_at <= now));
            trace!(target: "arbor::cache", path = %path, "Cache entry expired");
        }
        match lookup {
            CacheLookup::Hit(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            _ => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        lookup
    }

    /// Claim the load of a missing path
    ///
    /// Returns `None` if the cache is disabled or the path is already cached
    /// or being loaded.
    pub fn begin_load(&self, path: &NodePath) -> Option<LoadTicket<'_>> {
        if !self.enabled {
            return None;
        }
        match self.entries.entry(path.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let load_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
                let (sender, _) = watch::channel(None);
                vacant.insert(Slot::Loading { load_id, sender });
                Some(LoadTicket {
                    cache: self,
                    path: path.clone(),
                    load_id,
                    finished: false,
                })
            }
        }
    }

    /// Store or replace the info of a path
    pub fn update(&self, info: NodeInfo) {
        if !self.enabled {
            return;
        }
        trace!(target: "arbor::cache", path = %info.path, exists = info.exists, "Cache update");
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .insert(info.path.clone(), Slot::Ready { info, expires_at });
    }

    /// Drop the entry of a path, and of all its descendants if `recursive`
    pub fn invalidate(&self, path: &NodePath, recursive: bool) {
        if !self.enabled {
            return;
        }
        trace!(target: "arbor::cache", path = %path, recursive, "Cache invalidate");
        if recursive {
            self.entries.retain(|key, _| !path.is_ancestor_of(key));
        } else {
            self.entries.remove(path);
        }
    }

    /// Record that a path and all its descendants no longer exist
    pub fn mark_deleted(&self, path: &NodePath) {
        if !self.enabled {
            return;
        }
        trace!(target: "arbor::cache", path = %path, "Cache mark deleted");
        let expires_at = Instant::now() + self.ttl;
        // Loading entries below the path are dropped; their loads may have
        // read the old state.
        self.entries.retain(|key, slot| {
            if !path.is_ancestor_of(key) {
                return true;
            }
            match slot {
                Slot::Ready { info, expires_at: e } => {
                    *info = NodeInfo::not_found(key.clone());
                    *e = expires_at;
                    true
                }
                Slot::Loading { .. } => false,
            }
        });
        self.entries.insert(
            path.clone(),
            Slot::Ready {
                info: NodeInfo::not_found(path.clone()),
                expires_at,
            },
        );
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Exclusive right to load one path into the cache
///
/// Dropping an unfinished ticket abandons the load; waiting readers then
/// load the path themselves.
pub struct LoadTicket<'a> {
    cache: &'a NodeInfoCache,
    path: NodePath,
    load_id: u64,
    finished: bool,
}

impl LoadTicket<'_> {
    /// Publish the loaded info to the cache and to waiting readers
    ///
    /// If the entry was invalidated while loading, the info is handed to
    /// waiters but not cached.
    pub fn finish(mut self, info: &NodeInfo) {
        self.finished = true;
        let Some(mut slot) = self.cache.entries.get_mut(&self.path) else {
            return;
        };
        if !matches!(&*slot, Slot::Loading { load_id, .. } if *load_id == self.load_id) {
            return;
        }
        let ready = Slot::Ready {
            info: info.clone(),
            expires_at: Instant::now() + self.cache.ttl,
        };
        if let Slot::Loading { sender, .. } = std::mem::replace(&mut *slot, ready) {
            sender.send_replace(Some(info.clone()));
        }
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let load_id = self.load_id;
        self.cache.entries.remove_if(&self.path, |_, slot| {
            matches!(slot, Slot::Loading { load_id: id, .. } if *id == load_id)
        });
    }
}

/// Wait for another reader's load to complete
///
/// Returns `None` if that load was abandoned or invalidated.
pub async fn wait_for_load(mut receiver: watch::Receiver<Option<NodeInfo>>) -> Option<NodeInfo> {
    loop {
        if let Some(info) = receiver.borrow_and_update().clone() {
            return Some(info);
        }
        if receiver.changed().await.is_err() {
            return receiver.borrow().clone();
        }
    }
}
