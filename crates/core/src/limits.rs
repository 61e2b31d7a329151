//! Structural limits for paths and values
//!
//! | Limit | Value | Constant |
//! |-------|-------|----------|
//! | Max nesting depth | 100 levels | [`MAX_NESTING_DEPTH`] |
//! | Max path length | 256 segments | [`MAX_PATH_LENGTH`] |
//! | Max key length | 1024 bytes | [`MAX_KEY_BYTES`] |
//!
//! Stored values are owned trees, so a value can never reference itself.
//! The nesting limit is what stops runaway (or accidentally self-expanding)
//! input before it reaches the write engine.

use thiserror::Error;

/// Maximum nesting depth of a value written in one operation
pub const MAX_NESTING_DEPTH: usize = 100;

/// Maximum number of segments in a node path
pub const MAX_PATH_LENGTH: usize = 256;

/// Maximum length of a single object key in bytes
pub const MAX_KEY_BYTES: usize = 1024;

/// Default threshold (in encoded bytes) below which strings, binary values
/// and references are stored inline in their parent's record
pub const DEFAULT_MAX_INLINE_VALUE_SIZE: usize = 50;

/// Error type for limit violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// Value nesting exceeds maximum depth
    #[error("value nesting depth {depth} exceeds maximum of {max} levels")]
    NestingTooDeep {
        /// Actual nesting depth
        depth: usize,
        /// Maximum allowed depth
        max: usize,
    },

    /// Path exceeds maximum length
    #[error("path length {length} exceeds maximum of {max} segments")]
    PathTooLong {
        /// Actual path length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Key exceeds maximum byte length
    #[error("key length {length} exceeds maximum of {max} bytes")]
    KeyTooLong {
        /// Actual key length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },
}
