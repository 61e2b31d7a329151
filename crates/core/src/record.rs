//! Node records
//!
//! A [`NodeRecord`] is the unit the record store persists: one dedicated
//! node, together with every child small enough to be embedded in it.
//!
//! ```text
//! NodeRecord (users/alice)
//! ├── node_type: Object, revision: 3f2a…, revision_nr: 4
//! └── Children
//!     ├── name    -> Inline("Alice")
//!     ├── age     -> Inline(31)
//!     ├── tags    -> Inline(EmptyArray)
//!     └── address -> Dedicated        (record at users/alice/address)
//! ```
//!
//! Scalars that are too large to embed (long strings, binary, references)
//! get a record of their own with a [`RecordValue::Scalar`] value.

use crate::error::ArborResult;
use crate::path::PathSegment;
use crate::types::{NodeType, Revision};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Payload of a typed scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedPayload {
    /// Epoch milliseconds (dates)
    Millis(i64),
    /// Text (base64 binary, reference path)
    Text(String),
}

/// Storage-neutral form of a typed scalar: `{kind, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    /// DateTime, Binary or Reference
    pub kind: NodeType,
    /// Encoded payload
    pub value: TypedPayload,
}

/// Storage-neutral encoding of a scalar (or empty container)
///
/// Native strings, numbers and booleans pass through unchanged; dates,
/// binary and references become [`TypedValue`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Native string
    String(String),
    /// Native integer
    Int(i64),
    /// Native float
    Float(f64),
    /// Native boolean
    Bool(bool),
    /// Date, binary or reference
    Typed(TypedValue),
    /// Empty object `{}`
    EmptyObject,
    /// Empty array `[]`
    EmptyArray,
}

impl StoredValue {
    /// Node type of the encoded value
    pub fn node_type(&self) -> NodeType {
        match self {
            StoredValue::String(_) => NodeType::String,
            StoredValue::Int(_) | StoredValue::Float(_) => NodeType::Number,
            StoredValue::Bool(_) => NodeType::Boolean,
            StoredValue::Typed(t) => t.kind,
            StoredValue::EmptyObject => NodeType::Object,
            StoredValue::EmptyArray => NodeType::Array,
        }
    }
}

/// Entry for one child in a container record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildSlot {
    /// Child value embedded in this record
    Inline(StoredValue),
    /// Child has its own record at `<parent>/<key>`
    Dedicated,
}

impl ChildSlot {
    /// Check if the child has its own record
    pub fn is_dedicated(&self) -> bool {
        matches!(self, ChildSlot::Dedicated)
    }
}

/// Value held by a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    /// Scalar too large to embed in the parent
    Scalar(StoredValue),
    /// Object or array children
    Children(#[serde(with = "child_entries")] BTreeMap<PathSegment, ChildSlot>),
}

/// Persisted record of a dedicated node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Stored node type
    pub node_type: NodeType,
    /// Scalar value or child map
    pub value: RecordValue,
    /// Generation id, kept across updates
    pub revision: Revision,
    /// Update counter within the revision, starting at 1
    pub revision_nr: u64,
    /// Creation time (epoch ms)
    pub created: i64,
    /// Last modification time (epoch ms)
    pub modified: i64,
}

impl NodeRecord {
    /// Record for a node that did not exist before
    ///
    /// Assigns a fresh revision with `revision_nr = 1`.
    pub fn create(node_type: NodeType, value: RecordValue, now: i64) -> Self {
        NodeRecord {
            node_type,
            value,
            revision: Revision::generate(),
            revision_nr: 1,
            created: now,
            modified: now,
        }
    }

    /// Next version of an existing record
    ///
    /// Keeps `revision` and `created`, increments `revision_nr`.
    pub fn update(&self, node_type: NodeType, value: RecordValue, now: i64) -> Self {
        NodeRecord {
            node_type,
            value,
            revision: self.revision.clone(),
            revision_nr: self.revision_nr + 1,
            created: self.created,
            modified: now,
        }
    }

    /// Child map of a container record
    pub fn children(&self) -> Option<&BTreeMap<PathSegment, ChildSlot>> {
        match &self.value {
            RecordValue::Children(children) => Some(children),
            RecordValue::Scalar(_) => None,
        }
    }

    /// Slot of a direct child
    pub fn child_slot(&self, segment: &PathSegment) -> Option<&ChildSlot> {
        self.children().and_then(|children| children.get(segment))
    }

    /// Encode to bytes (MessagePack)
    pub fn encode(&self) -> ArborResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from bytes produced by [`NodeRecord::encode`]
    pub fn decode(bytes: &[u8]) -> ArborResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// Child maps are persisted as a sequence of (segment, slot) pairs so that
// enum keys never have to be map keys in the encoded form.
mod child_entries {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<PathSegment, ChildSlot>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PathSegment, ChildSlot>, D::Error> {
        let entries: Vec<(PathSegment, ChildSlot)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}
