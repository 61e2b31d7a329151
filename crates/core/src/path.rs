//! Node paths
//!
//! A [`NodePath`] addresses a node in the tree. It is a sequence of
//! [`PathSegment`]s: object keys, array indices and (in subscription or
//! index patterns only) wildcards.
//!
//! # Path Syntax
//!
//! | Syntax | Meaning | Example |
//! |--------|---------|---------|
//! | `key` | Object child | `users` |
//! | `[n]` or `n` | Array index (canonical integer) | `items[0]`, `items/0` |
//! | `a/b` | Nested child | `users/alice/name` |
//! | `*`, `$name` | Wildcard (patterns only) | `users/$uid/name` |
//! | (empty) | Root | `` |
//!
//! Leading and trailing slashes are ignored. A segment that is a canonical
//! non-negative integer (`0`, `17`, but not `007`) is always an index, so
//! `users/0/name` and `users[0]/name` name the same node. Paths display in
//! the bracketed form.
//!
//! Paths order lexicographically by segment, which keeps every subtree
//! contiguous in an ordered map: a node is immediately followed by all of
//! its descendants.

use crate::limits::{LimitError, MAX_KEY_BYTES, MAX_PATH_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for node path parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    /// Empty key between two slashes
    #[error("empty key in path at segment {0}")]
    EmptyKey(usize),
    /// `[` without matching `]`
    #[error("unclosed bracket in segment {0}")]
    UnclosedBracket(usize),
    /// Bracketed index that is not a non-negative integer
    #[error("invalid array index in segment {0}: {1}")]
    InvalidIndex(usize, String),
    /// Character that cannot appear at this position
    #[error("unexpected character '{0}' in segment {1}")]
    UnexpectedChar(char, usize),
    /// Wildcard used where a concrete path is required
    #[error("wildcards are not allowed in '{0}'")]
    WildcardNotAllowed(String),
}

/// A segment in a node path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSegment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
    /// `*` or `$name`; matches any single concrete segment
    Wildcard(String),
}

impl PathSegment {
    /// Segment for an object key taken from a value
    ///
    /// Canonical integers become [`PathSegment::Index`], which keeps the
    /// mapping from value keys to paths identical to path parsing.
    pub fn from_key(key: &str) -> Self {
        match parse_canonical_index(key) {
            Some(idx) => PathSegment::Index(idx),
            None => PathSegment::Key(key.to_string()),
        }
    }

    /// Check whether `key` can be used as an object key in a stored value
    pub fn validate_key(key: &str) -> Result<(), String> {
        if key.is_empty() {
            return Err("empty object key".to_string());
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(format!(
                "key of {} bytes exceeds maximum of {} bytes",
                key.len(),
                MAX_KEY_BYTES
            ));
        }
        if let Some(c) = key.chars().find(|c| matches!(c, '/' | '[' | ']')) {
            return Err(format!("key '{}' contains reserved character '{}'", key, c));
        }
        Ok(())
    }

    /// The key under which this segment appears in an object value
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(i) => i.to_string(),
            PathSegment::Wildcard(w) => w.clone(),
        }
    }

    /// Array index, if this is an index segment
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            _ => None,
        }
    }

    /// Check if this is a wildcard segment
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PathSegment::Wildcard(_))
    }

    /// Check if this (pattern) segment matches a concrete segment
    pub fn matches(&self, concrete: &PathSegment) -> bool {
        match self {
            PathSegment::Wildcard(_) => !concrete.is_wildcard(),
            other => other == concrete,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Wildcard(w) => write!(f, "{}", w),
        }
    }
}

fn parse_canonical_index(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

fn parse_head(head: &str) -> PathSegment {
    if head == "*" || head.starts_with('$') {
        PathSegment::Wildcard(head.to_string())
    } else {
        PathSegment::from_key(head)
    }
}

/// A path to a node in the tree
///
/// # Examples
///
/// ```
/// use arbor_core::path::NodePath;
///
/// let name = NodePath::root().key("users").index(0).key("name");
/// let parsed: NodePath = "users/0/name".parse().unwrap();
/// assert_eq!(name, parsed);
/// assert_eq!(name.to_string(), "users[0]/name");
///
/// let users: NodePath = "users".parse().unwrap();
/// assert!(users.is_ancestor_of(&name));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodePath {
    segments: Vec<PathSegment>,
}

impl NodePath {
    /// The root path (empty)
    pub fn root() -> Self {
        NodePath {
            segments: Vec::new(),
        }
    }

    /// Create a path from segments
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        NodePath { segments }
    }

    /// Parse a path that must not contain wildcards
    pub fn concrete(s: &str) -> Result<Self, PathParseError> {
        let path: NodePath = s.parse()?;
        if path.has_wildcards() {
            return Err(PathParseError::WildcardNotAllowed(s.to_string()));
        }
        Ok(path)
    }

    /// Path segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Number of segments (the depth of the node)
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if this is the root path
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Check if this is the root path
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append an object key (builder)
    pub fn key(mut self, key: impl AsRef<str>) -> Self {
        self.segments.push(PathSegment::from_key(key.as_ref()));
        self
    }

    /// Append an array index (builder)
    pub fn index(mut self, idx: usize) -> Self {
        self.segments.push(PathSegment::Index(idx));
        self
    }

    /// Child path for a segment
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut child = self.clone();
        child.segments.push(segment);
        child
    }

    /// Push a segment (mutating)
    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    /// Parent path (None for root)
    pub fn parent(&self) -> Option<NodePath> {
        if self.segments.is_empty() {
            None
        } else {
            let mut parent = self.clone();
            parent.segments.pop();
            Some(parent)
        }
    }

    /// Last segment (None for root)
    pub fn last_segment(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// First `len` segments of this path
    pub fn truncate(&self, len: usize) -> NodePath {
        NodePath::from_segments(self.segments[..len.min(self.segments.len())].to_vec())
    }

    /// Check if this path is an ancestor of another (or equal)
    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Check if this path is a descendant of another (or equal)
    pub fn is_descendant_of(&self, other: &NodePath) -> bool {
        other.is_ancestor_of(self)
    }

    /// Check if this path is a strict ancestor of another (not equal)
    pub fn is_strict_ancestor_of(&self, other: &NodePath) -> bool {
        self.segments.len() < other.segments.len() && self.is_ancestor_of(other)
    }

    /// Check if this path is a direct child of `parent`
    pub fn is_child_of(&self, parent: &NodePath) -> bool {
        self.segments.len() == parent.segments.len() + 1 && parent.is_ancestor_of(self)
    }

    /// Longest common prefix of both paths
    pub fn common_ancestor(&self, other: &NodePath) -> NodePath {
        let common = self
            .segments
            .iter()
            .zip(other.segments.iter())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.clone())
            .collect();
        NodePath::from_segments(common)
    }

    /// Check if two paths overlap (one is ancestor/descendant of the other)
    pub fn overlaps(&self, other: &NodePath) -> bool {
        self.is_ancestor_of(other) || self.is_descendant_of(other)
    }

    /// Segments of `self` below `ancestor`, if `ancestor` is an ancestor
    pub fn relative_to(&self, ancestor: &NodePath) -> Option<&[PathSegment]> {
        if ancestor.is_ancestor_of(self) {
            Some(&self.segments[ancestor.segments.len()..])
        } else {
            None
        }
    }

    /// Check if any segment is a wildcard
    pub fn has_wildcards(&self) -> bool {
        self.segments.iter().any(PathSegment::is_wildcard)
    }

    /// Check if this pattern matches `concrete` exactly (same depth)
    pub fn matches(&self, concrete: &NodePath) -> bool {
        self.segments.len() == concrete.segments.len() && self.matches_prefix_of(concrete)
    }

    /// Check if this pattern matches an ancestor of `concrete` (or itself)
    pub fn matches_prefix_of(&self, concrete: &NodePath) -> bool {
        self.segments.len() <= concrete.segments.len()
            && self
                .segments
                .iter()
                .zip(concrete.segments.iter())
                .all(|(p, c)| p.matches(c))
    }

    /// Check if this pattern could match some descendant of `concrete`
    pub fn extends(&self, concrete: &NodePath) -> bool {
        self.segments.len() > concrete.segments.len()
            && self
                .segments
                .iter()
                .zip(concrete.segments.iter())
                .all(|(p, c)| p.matches(c))
    }

    /// Resolve this pattern against `concrete`, filling in wildcards
    ///
    /// Returns the ancestor of `concrete` this pattern matches, if any.
    pub fn resolve_against(&self, concrete: &NodePath) -> Option<NodePath> {
        if self.matches_prefix_of(concrete) {
            Some(concrete.truncate(self.segments.len()))
        } else {
            None
        }
    }

    /// Validate path length and key sizes
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.segments.len() > MAX_PATH_LENGTH {
            return Err(LimitError::PathTooLong {
                length: self.segments.len(),
                max: MAX_PATH_LENGTH,
            });
        }
        for segment in &self.segments {
            if let PathSegment::Key(k) = segment {
                if k.len() > MAX_KEY_BYTES {
                    return Err(LimitError::KeyTooLong {
                        length: k.len(),
                        max: MAX_KEY_BYTES,
                    });
                }
            }
        }
        Ok(())
    }

    /// Canonical string form (`users[0]/name`)
    pub fn to_path_string(&self) -> String {
        let mut result = String::new();
        for segment in &self.segments {
            match segment {
                PathSegment::Index(i) => {
                    result.push('[');
                    result.push_str(&i.to_string());
                    result.push(']');
                }
                PathSegment::Key(k) | PathSegment::Wildcard(k) => {
                    if !result.is_empty() {
                        result.push('/');
                    }
                    result.push_str(k);
                }
            }
        }
        result
    }
}

impl FromStr for NodePath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(NodePath::root());
        }

        let mut segments = Vec::new();
        for (n, part) in trimmed.split('/').enumerate() {
            if part.is_empty() {
                return Err(PathParseError::EmptyKey(n));
            }

            let (head, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if head.contains(']') {
                return Err(PathParseError::UnexpectedChar(']', n));
            }
            if !head.is_empty() {
                segments.push(parse_head(head));
            }

            while !rest.is_empty() {
                let close = rest.find(']').ok_or(PathParseError::UnclosedBracket(n))?;
                let inner = &rest[1..close];
                if inner == "*" {
                    segments.push(PathSegment::Wildcard("*".to_string()));
                } else {
                    let idx = inner
                        .parse::<usize>()
                        .map_err(|_| PathParseError::InvalidIndex(n, inner.to_string()))?;
                    segments.push(PathSegment::Index(idx));
                }
                rest = &rest[close + 1..];
                if let Some(c) = rest.chars().next() {
                    if c != '[' {
                        return Err(PathParseError::UnexpectedChar(c, n));
                    }
                }
            }
        }

        Ok(NodePath { segments })
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path_string())
    }
}
