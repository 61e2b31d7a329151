//! Change tracker
//!
//! Structural diff between the value of a subtree before and after a write.
//! `Null` and absence are the same thing here: a node that is `Null` does not
//! exist.
//!
//! | old | new | result |
//! |-----|-----|--------|
//! | absent | absent | `Identical` |
//! | absent | present | `Added` |
//! | present | absent | `Removed` |
//! | object | object | `Identical` or `Changed` (key by key) |
//! | array | array | `Identical` or `Replaced` (arrays are not decomposed) |
//! | anything else | | `Identical` if equal, else `Replaced` |
//!
//! Scalars compare with [`Value`] equality: dates by instant, binary byte
//! for byte.

use arbor_core::{NodePath, PathSegment, Value};
use std::collections::BTreeSet;

/// Result of comparing two values
#[derive(Debug, Clone, PartialEq)]
pub enum ValueCompareResult {
    /// No difference
    Identical,
    /// Value did not exist before
    Added,
    /// Value no longer exists
    Removed,
    /// Object with changed children
    Changed(ChangeSet),
    /// Value replaced as a whole (different scalar, type change, or array)
    Replaced,
}

impl ValueCompareResult {
    /// Check if the values are identical
    pub fn is_identical(&self) -> bool {
        matches!(self, ValueCompareResult::Identical)
    }
}

/// Child-level changes of an object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSet {
    /// Keys that did not exist before
    pub added: Vec<PathSegment>,
    /// Keys that no longer exist
    pub removed: Vec<PathSegment>,
    /// Keys present on both sides whose values differ
    pub changed: Vec<ChildChange>,
}

impl ChangeSet {
    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Change of one child present before and after
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    /// Child key
    pub key: PathSegment,
    /// How the child changed
    pub change: ValueCompareResult,
}

/// Deepest changed path of a write, with its old and new value
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Changed node
    pub path: NodePath,
    /// Value before the write (None if it did not exist)
    pub old: Option<Value>,
    /// Value after the write (None if it no longer exists)
    pub new: Option<Value>,
}

/// Treat a `Null` value as absent
pub(crate) fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Union of the child keys of two values, in key order
pub(crate) fn child_keys(old: Option<&Value>, new: Option<&Value>) -> BTreeSet<PathSegment> {
    let mut keys = BTreeSet::new();
    for value in [old, new].into_iter().flatten() {
        keys.extend(value.children().into_iter().map(|(segment, _)| segment));
    }
    keys
}

/// Compare two values structurally
///
/// ```
/// use arbor_core::Value;
/// use arbor_engine::diff::{compare_values, ValueCompareResult};
///
/// let old = Value::object_from([("x", 1), ("y", 2)]);
/// let new = Value::object_from([("x", 1), ("y", 3), ("z", 4)]);
/// match compare_values(Some(&old), Some(&new)) {
///     ValueCompareResult::Changed(changes) => {
///         assert_eq!(changes.added.len(), 1);
///         assert_eq!(changes.changed.len(), 1);
///         assert!(changes.removed.is_empty());
///     }
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn compare_values(old: Option<&Value>, new: Option<&Value>) -> ValueCompareResult {
    match (present(old), present(new)) {
        (None, None) => ValueCompareResult::Identical,
        (None, Some(_)) => ValueCompareResult::Added,
        (Some(_), None) => ValueCompareResult::Removed,
        (Some(Value::Object(before)), Some(Value::Object(after))) => {
            let mut changes = ChangeSet::default();
            let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
            for key in keys {
                let segment = PathSegment::from_key(key);
                match compare_values(before.get(key), after.get(key)) {
                    ValueCompareResult::Identical => {}
                    ValueCompareResult::Added => changes.added.push(segment),
                    ValueCompareResult::Removed => changes.removed.push(segment),
                    change => changes.changed.push(ChildChange { key: segment, change }),
                }
            }
            if changes.is_empty() {
                ValueCompareResult::Identical
            } else {
                ValueCompareResult::Changed(changes)
            }
        }
        (Some(before), Some(after)) if before == after => ValueCompareResult::Identical,
        _ => ValueCompareResult::Replaced,
    }
}

/// Deepest changed paths between two values of the node at `path`
///
/// Objects are descended key by key; any other difference is reported at the
/// level where it occurs.
pub fn get_mutations(path: &NodePath, old: Option<&Value>, new: Option<&Value>) -> Vec<Mutation> {
    let mut mutations = Vec::new();
    collect_mutations(path, present(old), present(new), &mut mutations);
    mutations
}

fn collect_mutations(
    path: &NodePath,
    old: Option<&Value>,
    new: Option<&Value>,
    out: &mut Vec<Mutation>,
) {
    match (old, new) {
        (Some(before @ Value::Object(_)), Some(after @ Value::Object(_))) => {
            for key in child_keys(old, new) {
                collect_mutations(
                    &path.child(key.clone()),
                    present(before.child(&key)),
                    present(after.child(&key)),
                    out,
                );
            }
        }
        (None, None) => {}
        (Some(before), Some(after)) if before == after => {}
        _ => out.push(Mutation {
            path: path.clone(),
            old: old.cloned(),
            new: new.cloned(),
        }),
    }
}
