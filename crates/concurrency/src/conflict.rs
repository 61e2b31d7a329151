//! Lock conflict policies
//!
//! The lock manager asks a [`ConflictPolicy`] whether a requested lock may
//! coexist with a lock held by another transaction. Locks of the same
//! transaction never conflict with each other, so policies only ever see
//! pairs from different tids.
//!
//! # Policies
//!
//! - [`GlobalWriteExclusive`] (default): any number of readers, or exactly one
//!   writer, across the whole tree. Paths are ignored.
//! - [`OverlappingPaths`]: readers and writers conflict only when their paths
//!   overlap (one is an ancestor of, or equal to, the other).
//!
//! `OverlappingPaths` allows more concurrent writers but is not deadlock
//! free: a writer on `a/b` that bubbles up to `a` waits for a writer on
//! `a/c` doing the same. The lock timeout is the only way out of such a
//! cycle, so the engine uses `GlobalWriteExclusive`.

use arbor_core::NodePath;
use std::fmt;

/// One side of a conflict check
#[derive(Debug, Clone, Copy)]
pub struct LockRequest<'a> {
    /// Locked path
    pub path: &'a NodePath,
    /// Whether the lock is exclusive
    pub for_writing: bool,
}

impl<'a> LockRequest<'a> {
    /// Describe a lock on `path`
    pub fn new(path: &'a NodePath, for_writing: bool) -> Self {
        LockRequest { path, for_writing }
    }
}

/// Grant rule used by the lock manager
pub trait ConflictPolicy: Send + Sync + fmt::Debug {
    /// Check whether `requested` must wait for `held`
    ///
    /// Both locks belong to different transactions.
    fn conflicts(&self, requested: LockRequest<'_>, held: LockRequest<'_>) -> bool;
}

/// Readers share, writers are exclusive against every other transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalWriteExclusive;

impl ConflictPolicy for GlobalWriteExclusive {
    fn conflicts(&self, requested: LockRequest<'_>, held: LockRequest<'_>) -> bool {
        requested.for_writing || held.for_writing
    }
}

/// Readers share, writers are exclusive within overlapping subtrees
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlappingPaths;

impl ConflictPolicy for OverlappingPaths {
    fn conflicts(&self, requested: LockRequest<'_>, held: LockRequest<'_>) -> bool {
        (requested.for_writing || held.for_writing) && requested.path.overlaps(held.path)
    }
}
