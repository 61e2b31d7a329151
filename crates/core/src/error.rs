//! Error types for arbor
//!
//! One error enum is shared by every layer (codec, store, lock manager,
//! write engine). We use `thiserror` for the `Display` and `Error` impls.
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | `NotFound` | an operation requires a node that does not exist |
//! | `RevisionConflict` | an optimistic transaction read a stale revision |
//! | `InvalidValue` | void without stripping, too deep, non-object or null root |
//! | `ArrayContiguity` | an array merge leaves a gap or touches a non-tail index |
//! | `LockExpired` | any lock call for a tid whose lock timed out |
//! | `Store` | propagated verbatim from the record store |

use crate::limits::LimitError;
use crate::path::{NodePath, PathParseError};
use thiserror::Error;

/// Result type alias for arbor operations
pub type ArborResult<T> = std::result::Result<T, ArborError>;

/// Error types for the arbor database
#[derive(Debug, Error)]
pub enum ArborError {
    /// Node required by the operation does not exist
    #[error("node not found: /{0}")]
    NotFound(NodePath),

    /// Revision asserted by an optimistic transaction no longer matches
    #[error("revision conflict on /{path}: expected {expected}, found {found}")]
    RevisionConflict {
        /// Node path the transaction targeted
        path: NodePath,
        /// Revision observed by the read step
        expected: String,
        /// Revision found when writing
        found: String,
    },

    /// Value cannot be stored
    #[error("invalid value at /{path}: {reason}")]
    InvalidValue {
        /// Path of the offending value
        path: NodePath,
        /// Human-readable reason
        reason: String,
    },

    /// Path could not be parsed or is not usable for this operation
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathParseError),

    /// Array update would leave the key set non-contiguous
    #[error("array contiguity violation at /{path}: {reason}")]
    ArrayContiguity {
        /// Path of the array node
        path: NodePath,
        /// Which keys broke contiguity
        reason: String,
    },

    /// Lock of this transaction timed out; the tid is permanently unusable
    #[error("lock expired for transaction {tid}")]
    LockExpired {
        /// Transaction id
        tid: u64,
    },

    /// Lock handle refers to a lock that was already released
    #[error("lock for transaction {tid} was already released")]
    LockReleased {
        /// Transaction id
        tid: u64,
    },

    /// Error reported by the record store
    #[error("store error: {0}")]
    Store(String),

    /// Record encoding/decoding error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Structural limit exceeded
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// Configuration could not be loaded or is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ArborError {
    /// Create an `InvalidValue` error
    pub fn invalid_value(path: &NodePath, reason: impl Into<String>) -> Self {
        ArborError::InvalidValue {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    /// Create a `Store` error from any displayable store failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        ArborError::Store(err.to_string())
    }

    /// Whether an optimistic transaction should retry after this error
    pub fn is_conflict(&self) -> bool {
        matches!(self, ArborError::RevisionConflict { .. })
    }
}

impl From<rmp_serde::encode::Error> for ArborError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ArborError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}
