//! Lock manager
//!
//! Grants, queues and expires path locks on behalf of transactions.
//!
//! ## Lock lifecycle
//!
//! ```text
//! lock() ──> Pending ──(grantable)──> Locked ──release()──> Done
//!    │                                   │
//!    └──(grantable now)──────────────────┘
//!                                        └──(timeout)──> Expired
//! ```
//!
//! ## Grant rule
//!
//! A request is granted when the [`ConflictPolicy`] reports no conflict with
//! any Locked lock of another tid. With the default [`GlobalWriteExclusive`]
//! policy this means many readers or a single writer for the whole tree.
//!
//! A request that is not itself a priority request, and whose tid holds no
//! lock yet, also waits behind conflicting priority requests of other tids.
//! Priority requests come from re-targeted locks whose transaction already
//! made progress; they must not be overtaken by newcomers.
//!
//! ## Queue processing
//!
//! After every release or expiry the pending queue is ordered by priority
//! (priority first), then by request order, and every request that became
//! grantable is granted in that order.
//!
//! ## Timeout
//!
//! Every granted lock gets a watchdog task. Once the lock has been held for
//! the full timeout it logs a warning, then two more at 1/3 timeout
//! intervals. A lock still held 1/3 timeout after the third warning expires
//! the whole tid: all its locks are released, its pending requests fail,
//! and every later call for that tid fails with `LockExpired`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{ArborError, ArborResult, NodePath};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::conflict::{ConflictPolicy, GlobalWriteExclusive, LockRequest};
use crate::lock::{wait_for_grant, GrantReceiver, LockState, NodeLock, Tid};

/// Default hold time after which an unreleased lock starts getting warnings
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(90);

/// Warnings logged before an unreleased lock expires
const WATCHDOG_WARNINGS: u32 = 3;

/// Generation-checked index of a lock table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LockId {
    index: usize,
    generation: u64,
}

struct LockEntry {
    tid: Tid,
    path: NodePath,
    for_writing: bool,
    priority: bool,
    state: LockState,
    /// Request order, used for first-come-first-served among equal priority
    seq: u64,
    waiter: Option<oneshot::Sender<ArborResult<()>>>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    entry: Option<LockEntry>,
}

/// Arena of live locks plus the indexes kept over it
#[derive(Default)]
struct LockTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_tid: FxHashMap<Tid, Vec<LockId>>,
    pending: Vec<LockId>,
    expired: FxHashSet<Tid>,
    next_seq: u64,
}

impl LockTable {
    fn insert(&mut self, entry: LockEntry) -> LockId {
        let tid = entry.tid;
        let pending = entry.state == LockState::Pending;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        let id = LockId {
            index,
            generation: slot.generation,
        };
        self.by_tid.entry(tid).or_default().push(id);
        if pending {
            self.pending.push(id);
        }
        id
    }

    fn get(&self, id: LockId) -> Option<&LockEntry> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn get_mut(&mut self, id: LockId) -> Option<&mut LockEntry> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn remove(&mut self, id: LockId) -> Option<LockEntry> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(id.index);

        if let Some(ids) = self.by_tid.get_mut(&entry.tid) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_tid.remove(&entry.tid);
            }
        }
        self.pending.retain(|other| *other != id);
        Some(entry)
    }

    fn live(&self) -> impl Iterator<Item = &LockEntry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    fn holds_locked(&self, tid: Tid) -> bool {
        self.by_tid.get(&tid).map_or(false, |ids| {
            ids.iter()
                .any(|id| self.get(*id).map_or(false, |e| e.state == LockState::Locked))
        })
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Snapshot of lock table counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    /// Granted locks
    pub locked: usize,
    /// Requests waiting to be granted
    pub pending: usize,
    /// Transactions whose locks timed out
    pub expired_tids: usize,
}

/// Path lock manager
///
/// Shared as `Arc<LockManager>`: handles and watchdog tasks refer back to it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use arbor_concurrency::LockManager;
///
/// let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
/// rt.block_on(async {
///     let manager = Arc::new(LockManager::default());
///     let tid = manager.next_tid();
///     let lock = manager.lock("users/alice".parse().unwrap(), tid, true).await.unwrap();
///     assert!(lock.for_writing());
///     lock.release().unwrap();
/// });
/// ```
pub struct LockManager {
    table: Mutex<LockTable>,
    policy: Box<dyn ConflictPolicy>,
    timeout: Duration,
    next_tid: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl LockManager {
    /// Create a lock manager with the global write-exclusive policy
    pub fn new(timeout: Duration) -> Self {
        Self::with_policy(timeout, Box::new(GlobalWriteExclusive))
    }

    /// Create a lock manager with a custom grant rule
    pub fn with_policy(timeout: Duration, policy: Box<dyn ConflictPolicy>) -> Self {
        LockManager {
            table: Mutex::new(LockTable::default()),
            policy,
            timeout,
            next_tid: AtomicU64::new(1),
        }
    }

    /// Lock timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate a fresh transaction id
    pub fn next_tid(&self) -> Tid {
        Tid(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }

    /// Request a lock, waiting until it is granted
    ///
    /// # Errors
    ///
    /// Returns `LockExpired` if `tid` expired before or while waiting.
    pub async fn lock(
        self: &Arc<Self>,
        path: NodePath,
        tid: Tid,
        for_writing: bool,
    ) -> ArborResult<NodeLock> {
        self.lock_with_priority(path, tid, for_writing, false).await
    }

    /// Request a lock with an explicit priority
    ///
    /// Priority requests are served before all non-priority ones.
    ///
    /// # Errors
    ///
    /// Returns `LockExpired` if `tid` expired before or while waiting.
    pub async fn lock_with_priority(
        self: &Arc<Self>,
        path: NodePath,
        tid: Tid,
        for_writing: bool,
        priority: bool,
    ) -> ArborResult<NodeLock> {
        let (id, waiter) = {
            let mut table = self.table.lock();
            self.enqueue(&mut table, tid, path.clone(), for_writing, priority)?
        };
        // Built before waiting so that a cancelled wait drops the request.
        let handle = NodeLock {
            manager: Arc::clone(self),
            id,
            tid,
            path,
            for_writing,
            released: false,
        };
        if let Some(waiter) = waiter {
            wait_for_grant(waiter, tid).await?;
        }
        Ok(handle)
    }

    /// Check whether a tid's locks timed out
    pub fn is_expired(&self, tid: Tid) -> bool {
        self.table.lock().expired.contains(&tid)
    }

    /// Current lock table counters
    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        let mut stats = LockStats {
            expired_tids: table.expired.len(),
            ..LockStats::default()
        };
        for entry in table.live() {
            match entry.state {
                LockState::Locked => stats.locked += 1,
                LockState::Pending => stats.pending += 1,
                LockState::Expired | LockState::Done => {}
            }
        }
        stats
    }

    pub(crate) fn state_of(&self, id: LockId, tid: Tid) -> LockState {
        let table = self.table.lock();
        if table.expired.contains(&tid) {
            return LockState::Expired;
        }
        table.get(id).map_or(LockState::Done, |entry| entry.state)
    }

    pub(crate) fn release(self: &Arc<Self>, id: LockId, tid: Tid) -> ArborResult<()> {
        let mut table = self.table.lock();
        if table.expired.contains(&tid) {
            return Err(ArborError::LockExpired { tid: tid.0 });
        }
        let entry = table
            .remove(id)
            .ok_or(ArborError::LockReleased { tid: tid.0 })?;
        debug!(
            target: "arbor::lock",
            tid = tid.0,
            path = %entry.path,
            was = ?entry.state,
            "Lock released"
        );
        self.process_queue(&mut table);
        Ok(())
    }

    pub(crate) fn retarget(
        self: &Arc<Self>,
        id: LockId,
        tid: Tid,
        path: NodePath,
        for_writing: bool,
    ) -> ArborResult<(LockId, Option<GrantReceiver>)> {
        let mut table = self.table.lock();
        if table.expired.contains(&tid) {
            return Err(ArborError::LockExpired { tid: tid.0 });
        }
        let from = match table.get(id) {
            Some(entry) if entry.state == LockState::Locked => entry.path.clone(),
            _ => return Err(ArborError::LockReleased { tid: tid.0 }),
        };

        if !self.is_blocked(&table, tid, &path, for_writing, true) {
            if let Some(entry) = table.get_mut(id) {
                entry.path = path;
                entry.for_writing = for_writing;
                debug!(target: "arbor::lock", tid = tid.0, from = %from, to = %entry.path, "Lock moved");
            }
            return Ok((id, None));
        }

        // Give up the old lock without waking anyone, then queue ahead of
        // every non-priority request.
        table.remove(id);
        debug!(target: "arbor::lock", tid = tid.0, from = %from, to = %path, "Lock re-requested with priority");
        self.enqueue(&mut table, tid, path, for_writing, true)
    }

    fn enqueue(
        self: &Arc<Self>,
        table: &mut LockTable,
        tid: Tid,
        path: NodePath,
        for_writing: bool,
        priority: bool,
    ) -> ArborResult<(LockId, Option<GrantReceiver>)> {
        if table.expired.contains(&tid) {
            return Err(ArborError::LockExpired { tid: tid.0 });
        }
        let seq = table.next_seq();
        let bypass_pending = priority || table.holds_locked(tid);

        if !self.is_blocked(table, tid, &path, for_writing, bypass_pending) {
            debug!(target: "arbor::lock", tid = tid.0, path = %path, for_writing, "Lock granted");
            let id = table.insert(LockEntry {
                tid,
                path,
                for_writing,
                priority,
                state: LockState::Locked,
                seq,
                waiter: None,
            });
            self.arm_watchdog(id);
            return Ok((id, None));
        }

        debug!(target: "arbor::lock", tid = tid.0, path = %path, for_writing, priority, "Lock queued");
        let (sender, receiver) = oneshot::channel();
        let id = table.insert(LockEntry {
            tid,
            path,
            for_writing,
            priority,
            state: LockState::Pending,
            seq,
            waiter: Some(sender),
        });
        Ok((id, Some(receiver)))
    }

    fn is_blocked(
        &self,
        table: &LockTable,
        tid: Tid,
        path: &NodePath,
        for_writing: bool,
        bypass_pending: bool,
    ) -> bool {
        let requested = LockRequest::new(path, for_writing);
        table.live().any(|held| {
            let counts = match held.state {
                LockState::Locked => true,
                LockState::Pending => !bypass_pending && held.priority,
                LockState::Expired | LockState::Done => false,
            };
            held.tid != tid
                && counts
                && self
                    .policy
                    .conflicts(requested, LockRequest::new(&held.path, held.for_writing))
        })
    }

    fn process_queue(self: &Arc<Self>, table: &mut LockTable) {
        let mut order: Vec<(bool, u64, LockId)> = table
            .pending
            .iter()
            .filter_map(|id| table.get(*id).map(|e| (!e.priority, e.seq, *id)))
            .collect();
        order.sort_unstable_by_key(|(not_priority, seq, _)| (*not_priority, *seq));

        for (_, _, id) in order {
            let Some(entry) = table.get(id) else { continue };
            let tid = entry.tid;
            let bypass_pending = entry.priority || table.holds_locked(tid);
            if self.is_blocked(table, tid, &entry.path, entry.for_writing, bypass_pending) {
                continue;
            }

            table.pending.retain(|other| *other != id);
            if let Some(entry) = table.get_mut(id) {
                entry.state = LockState::Locked;
                debug!(target: "arbor::lock", tid = tid.0, path = %entry.path, "Queued lock granted");
                if let Some(waiter) = entry.waiter.take() {
                    // A closed receiver means the waiting handle is being
                    // dropped and will release this slot itself.
                    let _ = waiter.send(Ok(()));
                }
            }
            self.arm_watchdog(id);
        }
    }

    fn arm_watchdog(self: &Arc<Self>, id: LockId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target: "arbor::lock", "No tokio runtime, lock timeout not armed");
            return;
        };
        let manager = Arc::downgrade(self);
        let timeout = self.timeout;
        let step = timeout / WATCHDOG_WARNINGS;
        runtime.spawn(async move {
            let mut delay = timeout;
            for stage in 1..=WATCHDOG_WARNINGS + 1 {
                tokio::time::sleep(delay).await;
                delay = step;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if !manager.watchdog_tick(id, stage) {
                    return;
                }
            }
        });
    }

    /// Stages `1..=WATCHDOG_WARNINGS` warn, the next one expires
    ///
    /// Returns whether the watchdog should keep running.
    fn watchdog_tick(self: &Arc<Self>, id: LockId, stage: u32) -> bool {
        let mut table = self.table.lock();
        let (tid, path) = match table.get(id) {
            Some(entry) if entry.state == LockState::Locked => (entry.tid, entry.path.clone()),
            _ => return false,
        };

        if stage <= WATCHDOG_WARNINGS {
            warn!(
                target: "arbor::lock",
                tid = tid.0,
                path = %path,
                held_secs = (self.timeout + self.timeout / WATCHDOG_WARNINGS * (stage - 1)).as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "Lock not released within its timeout, warning {}/{}",
                stage,
                WATCHDOG_WARNINGS
            );
            return true;
        }

        error!(
            target: "arbor::lock",
            tid = tid.0,
            path = %path,
            timeout_secs = self.timeout.as_secs(),
            warnings = WATCHDOG_WARNINGS,
            "Lock still held after final warning, expiring transaction"
        );
        self.expire(&mut table, tid);
        false
    }

    fn expire(self: &Arc<Self>, table: &mut LockTable, tid: Tid) {
        table.expired.insert(tid);
        let ids = table.by_tid.get(&tid).cloned().unwrap_or_default();
        for id in ids {
            if let Some(mut entry) = table.remove(id) {
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Err(ArborError::LockExpired { tid: tid.0 }));
                }
            }
        }
        self.process_queue(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(tid: u64, state: LockState) -> LockEntry {
        LockEntry {
            tid: Tid(tid),
            path: NodePath::root(),
            for_writing: false,
            priority: false,
            state,
            seq: 0,
            waiter: None,
        }
    }

    #[test]
    fn test_table_reused_slot_rejects_stale_id() {
        let mut table = LockTable::default();
        let first = table.insert(entry(1, LockState::Locked));
        assert!(table.remove(first).is_some());

        let second = table.insert(entry(2, LockState::Locked));
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(table.get(second).map(|e| e.tid), Some(Tid(2)));
    }

    #[test]
    fn test_table_indexes_track_entries() {
        let mut table = LockTable::default();
        let locked = table.insert(entry(1, LockState::Locked));
        let pending = table.insert(entry(1, LockState::Pending));
        assert_eq!(table.by_tid[&Tid(1)].len(), 2);
        assert_eq!(table.pending, vec![pending]);
        assert!(table.holds_locked(Tid(1)));

        table.remove(locked);
        assert!(!table.holds_locked(Tid(1)));
        table.remove(pending);
        assert!(table.pending.is_empty());
        assert!(!table.by_tid.contains_key(&Tid(1)));
    }

    #[test]
    fn test_grant_without_runtime_skips_watchdog() {
        let manager = Arc::new(LockManager::default());
        let mut table = manager.table.lock();
        let (_, waiter) = manager
            .enqueue(&mut table, Tid(1), NodePath::root(), true, false)
            .unwrap();
        assert!(waiter.is_none());
    }

    #[test]
    fn test_watchdog_expires_only_after_final_warning() {
        let manager = Arc::new(LockManager::default());
        let (id, _) = {
            let mut table = manager.table.lock();
            manager
                .enqueue(&mut table, Tid(1), NodePath::root(), true, false)
                .unwrap()
        };
        for stage in 1..=WATCHDOG_WARNINGS {
            assert!(manager.watchdog_tick(id, stage));
            assert_eq!(manager.state_of(id, Tid(1)), LockState::Locked);
        }
        assert!(!manager.watchdog_tick(id, WATCHDOG_WARNINGS + 1));
        assert_eq!(manager.state_of(id, Tid(1)), LockState::Expired);
        assert!(manager.is_expired(Tid(1)));
    }

    #[test]
    fn test_pending_priority_blocks_newcomers() {
        let manager = Arc::new(LockManager::default());
        let mut table = manager.table.lock();
        let reader = NodePath::root().key("x");
        manager
            .enqueue(&mut table, Tid(1), reader.clone(), false, false)
            .unwrap();
        let (_, waiter) = manager
            .enqueue(&mut table, Tid(2), NodePath::root().key("a"), true, true)
            .unwrap();
        assert!(waiter.is_some());

        // Compatible with the held read lock, but not with tid 2's pending write
        let (_, waiter) = manager
            .enqueue(&mut table, Tid(3), reader, false, false)
            .unwrap();
        assert!(waiter.is_some());
    }

    proptest! {
        #[test]
        fn prop_live_ids_never_alias(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut table = LockTable::default();
            let mut live: Vec<LockId> = Vec::new();
            for (i, insert) in ops.into_iter().enumerate() {
                if insert || live.is_empty() {
                    live.push(table.insert(entry(i as u64, LockState::Locked)));
                } else {
                    let id = live.remove(i % live.len());
                    prop_assert!(table.remove(id).is_some());
                }
                for id in &live {
                    prop_assert!(table.get(*id).is_some());
                }
            }
            prop_assert_eq!(table.live().count(), live.len());
        }
    }
}
