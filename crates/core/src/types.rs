//! Node metadata types
//!
//! - NodeType: stored type of a node, with stable numeric codes
//! - Revision: opaque generation id of a node
//! - NodeAddress: where a node's dedicated record lives
//! - NodeInfo: what is known about a node (existence, type, address, revision)

use crate::path::NodePath;
use crate::record::NodeRecord;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stored type of a node
///
/// The discriminants are stable and may be persisted by record stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Object with string keys
    Object = 1,
    /// Array with contiguous indices starting at 0
    Array = 2,
    /// Number (integer or float)
    Number = 3,
    /// Boolean
    Boolean = 4,
    /// UTF-8 string
    String = 5,
    /// Date/time, stored as epoch milliseconds
    DateTime = 6,
    /// Binary blob
    Binary = 8,
    /// Path reference
    Reference = 9,
}

impl NodeType {
    /// Stable numeric code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a node type by numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(NodeType::Object),
            2 => Some(NodeType::Array),
            3 => Some(NodeType::Number),
            4 => Some(NodeType::Boolean),
            5 => Some(NodeType::String),
            6 => Some(NodeType::DateTime),
            8 => Some(NodeType::Binary),
            9 => Some(NodeType::Reference),
            _ => None,
        }
    }

    /// Check if nodes of this type can have children
    pub fn is_container(self) -> bool {
        matches!(self, NodeType::Object | NodeType::Array)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Object => "object",
            NodeType::Array => "array",
            NodeType::Number => "number",
            NodeType::Boolean => "boolean",
            NodeType::String => "string",
            NodeType::DateTime => "date",
            NodeType::Binary => "binary",
            NodeType::Reference => "reference",
        };
        write!(f, "{}", name)
    }
}

/// Opaque generation id of a node
///
/// A revision is kept across updates and regenerated only when a node is
/// deleted and later recreated. `revision_nr` counts updates within one
/// revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    /// Generate a fresh revision id
    pub fn generate() -> Self {
        Revision(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing revision id
    pub fn from_string(id: impl Into<String>) -> Self {
        Revision(id.into())
    }

    /// Revision id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location of a node's dedicated record
///
/// For the pluggable record store the address is the node's path. Backends
/// with a physical layout keep their own coordinates behind the path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    path: NodePath,
}

impl NodeAddress {
    /// Address of the record stored at `path`
    pub fn new(path: NodePath) -> Self {
        NodeAddress { path }
    }

    /// Record path
    pub fn path(&self) -> &NodePath {
        &self.path
    }
}

/// Current time in milliseconds since the Unix epoch
///
/// Returns 0 if the system clock is before the epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Information about a node
///
/// Reads return a non-existent `NodeInfo` rather than an error when a node
/// is missing. Inline nodes have no address and no revision; their value is
/// carried along since it lives in the parent's record anyway.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Node path
    pub path: NodePath,
    /// Whether the node exists
    pub exists: bool,
    /// Stored type (None if the node does not exist)
    pub node_type: Option<NodeType>,
    /// Dedicated record address (None for inline or missing nodes)
    pub address: Option<NodeAddress>,
    /// Value of an inline node
    pub value: Option<Value>,
    /// Revision of a dedicated node
    pub revision: Option<Revision>,
    /// Update counter within the revision (0 if not dedicated)
    pub revision_nr: u64,
    /// Creation time in epoch ms (dedicated nodes)
    pub created: Option<i64>,
    /// Last modification time in epoch ms (dedicated nodes)
    pub modified: Option<i64>,
}

impl NodeInfo {
    /// Info for a node that does not exist
    pub fn not_found(path: NodePath) -> Self {
        NodeInfo {
            path,
            exists: false,
            node_type: None,
            address: None,
            value: None,
            revision: None,
            revision_nr: 0,
            created: None,
            modified: None,
        }
    }

    /// Info for a node stored in its own record
    pub fn dedicated(path: NodePath, record: &NodeRecord) -> Self {
        NodeInfo {
            address: Some(NodeAddress::new(path.clone())),
            path,
            exists: true,
            node_type: Some(record.node_type),
            value: None,
            revision: Some(record.revision.clone()),
            revision_nr: record.revision_nr,
            created: Some(record.created),
            modified: Some(record.modified),
        }
    }

    /// Info for a node stored inline in its parent's record
    pub fn inline(path: NodePath, node_type: NodeType, value: Value) -> Self {
        NodeInfo {
            path,
            exists: true,
            node_type: Some(node_type),
            address: None,
            value: Some(value),
            revision: None,
            revision_nr: 0,
            created: None,
            modified: None,
        }
    }

    /// Check if the node is stored inline in its parent
    pub fn is_inline(&self) -> bool {
        self.exists && self.address.is_none()
    }

    /// Check if the node has its own record
    pub fn is_dedicated(&self) -> bool {
        self.address.is_some()
    }
}
