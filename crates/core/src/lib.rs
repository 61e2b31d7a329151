//! Core types for arbor
//!
//! This crate defines the foundational types used throughout the system:
//! - NodePath / PathSegment: slash-delimited addresses of tree nodes
//! - Value: closed tagged enum for everything that can be stored
//! - NodeType, Revision, NodeAddress, NodeInfo: node metadata
//! - NodeRecord: the persisted unit (one dedicated node plus its inline children)
//! - codec: inline vs. dedicated classification and scalar encoding
//! - ArborError: error taxonomy shared by all layers
//! - limits: nesting, path and key limits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod limits;
pub mod path;
pub mod record;
pub mod types;
pub mod value;

pub use codec::{decode_inline_scalar, encode_inline_scalar, fits_inline};
pub use error::{ArborError, ArborResult};
pub use limits::{
    LimitError, DEFAULT_MAX_INLINE_VALUE_SIZE, MAX_KEY_BYTES, MAX_NESTING_DEPTH, MAX_PATH_LENGTH,
};
pub use path::{NodePath, PathParseError, PathSegment};
pub use record::{ChildSlot, NodeRecord, RecordValue, StoredValue, TypedPayload, TypedValue};
pub use types::{now_millis, NodeAddress, NodeInfo, NodeType, Revision};
pub use value::Value;
