//! Storage layer for arbor
//!
//! This crate defines the record store seam and an in-memory backend:
//! - RecordStore / StoreTransaction: pluggable transactional path -> record map
//! - MemoryStore: BTreeMap-based storage with RwLock and staged transactions
//!
//! Records are keyed by [`arbor_core::NodePath`]; path order keeps every
//! subtree contiguous so descendant scans are range scans.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{PathFilter, RecordStore, StoreTransaction};
