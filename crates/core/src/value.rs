//! Value types for arbor
//!
//! [`Value`] is the logical, caller-facing value stored at a path. It is a
//! closed tagged enum: containers, native scalars and the typed scalars
//! (dates, binary blobs, path references) that need special encoding.
//!
//! ## Equality
//!
//! - Different variants are never equal: `Int(1) != Float(1.0)`
//! - Floats compare by bit pattern: a `NaN` equals itself, `-0.0 != 0.0`
//! - Dates compare by instant, binary byte-for-byte
//!
//! `Void` models an absent ("undefined") property in input values. It is
//! never stored: the write engine either rejects it or strips it.

use crate::limits::{LimitError, MAX_NESTING_DEPTH};
use crate::path::{NodePath, PathSegment};
use crate::types::NodeType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical value type stored in the tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null; writing null removes a node
    Null,
    /// Undefined property (input only)
    Void,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Point in time (millisecond precision once stored)
    DateTime(DateTime<Utc>),
    /// Raw bytes
    Binary(Vec<u8>),
    /// Typed reference to another node
    Reference(NodePath),
    /// Array of values
    Array(Vec<Value>),
    /// Object with string keys
    Object(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    /// Create an empty object
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Create an empty array
    pub fn array() -> Self {
        Value::Array(Vec::new())
    }

    /// Build an object from key/value pairs
    pub fn object_from<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Void => "Void",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::DateTime(_) => "DateTime",
            Value::Binary(_) => "Binary",
            Value::Reference(_) => "Reference",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
        }
    }

    /// Node type this value is stored as (None for Null and Void)
    pub fn node_type(&self) -> Option<NodeType> {
        match self {
            Value::Null | Value::Void => None,
            Value::Bool(_) => Some(NodeType::Boolean),
            Value::Int(_) | Value::Float(_) => Some(NodeType::Number),
            Value::String(_) => Some(NodeType::String),
            Value::DateTime(_) => Some(NodeType::DateTime),
            Value::Binary(_) => Some(NodeType::Binary),
            Value::Reference(_) => Some(NodeType::Reference),
            Value::Array(_) => Some(NodeType::Array),
            Value::Object(_) => Some(NodeType::Object),
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this is a void (undefined) value
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Check if this is an object
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Check if this is an array
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Check if this is an object or array
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Array(_))
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if this is a Float or Int value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get object entries if this is an Object value
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Get array elements if this is an Array value
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Children of a container value as (segment, value) pairs
    ///
    /// Scalars have no children.
    pub fn children(&self) -> Vec<(PathSegment, &Value)> {
        match self {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (PathSegment::from_key(k), v))
                .collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (PathSegment::Index(i), v))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Direct child by segment
    pub fn child(&self, segment: &PathSegment) -> Option<&Value> {
        match (self, segment) {
            (Value::Object(map), seg) => map.get(&seg.as_key()),
            (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
            _ => None,
        }
    }

    /// Descendant by relative segments
    pub fn get_relative(&self, segments: &[PathSegment]) -> Option<&Value> {
        segments
            .iter()
            .try_fold(self, |current, segment| current.child(segment))
    }

    /// Maximum nesting depth (0 for scalars)
    pub fn nesting_depth(&self) -> usize {
        match self {
            Value::Array(items) => 1 + items.iter().map(Value::nesting_depth).max().unwrap_or(0),
            Value::Object(map) => 1 + map.values().map(Value::nesting_depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Validate the nesting depth limit
    pub fn validate_depth(&self) -> Result<(), LimitError> {
        let depth = self.nesting_depth();
        if depth > MAX_NESTING_DEPTH {
            Err(LimitError::NestingTooDeep {
                depth,
                max: MAX_NESTING_DEPTH,
            })
        } else {
            Ok(())
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<NodePath> for Value {
    fn from(path: NodePath) -> Self {
        Value::Reference(path)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_different_variants_never_equal() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::String("x".into()), Value::Binary(b"x".to_vec()));
        assert_ne!(Value::Null, Value::Void);
    }

    #[test]
    fn test_float_bitwise_equality() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(2.5), Value::Float(2.5));

        let nested = Value::object_from([("x", Value::Float(f64::NAN)), ("n", Value::Int(0))]);
        assert_eq!(nested, nested.clone());
    }

    #[test]
    fn test_node_type_mapping() {
        assert_eq!(Value::Int(3).node_type(), Some(NodeType::Number));
        assert_eq!(Value::Float(3.5).node_type(), Some(NodeType::Number));
        assert_eq!(Value::object().node_type(), Some(NodeType::Object));
        assert_eq!(Value::array().node_type(), Some(NodeType::Array));
        assert_eq!(Value::Null.node_type(), None);
        assert_eq!(Value::Void.node_type(), None);
    }

    #[test]
    fn test_children_of_object_and_array() {
        let obj = Value::object_from([("b", Value::Int(2)), ("a", Value::Int(1))]);
        let keys: Vec<_> = obj.children().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                PathSegment::Key("a".to_string()),
                PathSegment::Key("b".to_string())
            ]
        );

        let arr = Value::Array(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(arr.child(&PathSegment::Index(1)), Some(&Value::Int(20)));
        assert_eq!(arr.child(&PathSegment::Index(2)), None);
    }

    #[test]
    fn test_numeric_object_key_is_reachable_by_index_segment() {
        let obj = Value::object_from([("42", Value::Bool(true))]);
        let children = obj.children();
        assert_eq!(children[0].0, PathSegment::Index(42));
        assert_eq!(obj.child(&PathSegment::Index(42)), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_get_relative() {
        let value = Value::object_from([(
            "users",
            Value::Array(vec![Value::object_from([("name", "Alice")])]),
        )]);
        let path: NodePath = "users/0/name".parse().unwrap();
        assert_eq!(
            value.get_relative(path.segments()),
            Some(&Value::String("Alice".into()))
        );
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut value = Value::Int(1);
        for _ in 0..=MAX_NESTING_DEPTH {
            value = Value::Array(vec![value]);
        }
        assert!(matches!(
            value.validate_depth(),
            Err(LimitError::NestingTooDeep { .. })
        ));
        assert!(Value::object().validate_depth().is_ok());
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    }
}
