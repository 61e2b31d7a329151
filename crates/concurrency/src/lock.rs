//! Lock handles
//!
//! A [`NodeLock`] is the owned handle returned by
//! [`LockManager::lock`](crate::LockManager::lock). It addresses its slot in
//! the manager's lock table by a generation-checked id, so a handle that
//! outlives its lock can never touch another transaction's lock.

use std::fmt;
use std::sync::Arc;

use arbor_core::{ArborError, ArborResult, NodePath};
use tokio::sync::oneshot;
use tracing::debug;

use crate::manager::{LockId, LockManager};

/// Transaction identifier
///
/// Locks of the same tid never conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u64);

impl Tid {
    /// Raw id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Lifecycle state of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Requested, waiting to be granted
    Pending,
    /// Granted
    Locked,
    /// Still held after the final timeout warning; the tid is unusable
    Expired,
    /// Released
    Done,
}

/// Owned handle to a granted lock
///
/// Dropping a handle that was not released releases the lock.
pub struct NodeLock {
    pub(crate) manager: Arc<LockManager>,
    pub(crate) id: LockId,
    pub(crate) tid: Tid,
    pub(crate) path: NodePath,
    pub(crate) for_writing: bool,
    pub(crate) released: bool,
}

impl NodeLock {
    /// Transaction owning this lock
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Currently locked path
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Whether this is a write lock
    pub fn for_writing(&self) -> bool {
        self.for_writing
    }

    /// Current state as seen by the lock manager
    pub fn state(&self) -> LockState {
        self.manager.state_of(self.id, self.tid)
    }

    /// Release the lock and let waiting requests proceed
    ///
    /// # Errors
    ///
    /// - `LockExpired` if the lock timed out before release.
    /// - `LockReleased` if the lock no longer exists.
    pub fn release(mut self) -> ArborResult<()> {
        self.released = true;
        self.manager.release(self.id, self.tid)
    }

    /// Re-target the lock to the parent path, keeping its mode
    ///
    /// # Errors
    ///
    /// - `InvalidValue` when the lock is already on the root.
    /// - `LockExpired` / `LockReleased` as for [`NodeLock::release`].
    pub async fn move_to_parent(&mut self) -> ArborResult<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ArborError::invalid_value(&self.path, "root lock has no parent"))?;
        self.move_to(parent, self.for_writing).await
    }

    /// Re-target the lock to `path`, optionally changing its mode
    ///
    /// If the new lock can be granted right away the existing lock is updated
    /// in place. Otherwise the lock is given up and requested again with
    /// priority, and this call waits until the new request is granted.
    ///
    /// # Errors
    ///
    /// - `LockExpired` if the tid expired before or while waiting.
    /// - `LockReleased` if the lock no longer exists.
    pub async fn move_to(&mut self, path: NodePath, for_writing: bool) -> ArborResult<()> {
        let (id, waiter) = self
            .manager
            .retarget(self.id, self.tid, path.clone(), for_writing)?;
        self.id = id;
        self.path = path;
        self.for_writing = for_writing;
        if let Some(waiter) = waiter {
            wait_for_grant(waiter, self.tid).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock")
            .field("tid", &self.tid)
            .field("path", &self.path)
            .field("for_writing", &self.for_writing)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(self.id, self.tid) {
            debug!(target: "arbor::lock", tid = self.tid.0, error = %e, "Dropped lock was not releasable");
        }
    }
}

pub(crate) type GrantReceiver = oneshot::Receiver<ArborResult<()>>;

pub(crate) async fn wait_for_grant(waiter: GrantReceiver, tid: Tid) -> ArborResult<()> {
    waiter
        .await
        .map_err(|_| ArborError::LockReleased { tid: tid.0 })?
}
