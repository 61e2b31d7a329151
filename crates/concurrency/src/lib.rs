//! Concurrency layer for arbor
//!
//! This crate implements the path lock manager with:
//! - LockManager: grants, queues and expires locks per transaction id
//! - NodeLock: owned, generation-checked lock handle with re-targeting
//! - ConflictPolicy: pluggable grant rule (global write exclusivity by default)
//! - Timeout watchdogs with escalating warnings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod lock;
pub mod manager;

pub use conflict::{ConflictPolicy, GlobalWriteExclusive, LockRequest, OverlappingPaths};
pub use lock::{LockState, NodeLock, Tid};
pub use manager::{LockManager, LockStats, DEFAULT_LOCK_TIMEOUT};
