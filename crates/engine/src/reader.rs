//! Node reader
//!
//! A node exists either as its own record, or as an inline slot in its
//! parent's record. Values are rebuilt by combining inline slots with the
//! records of dedicated descendants, which are fetched with one range scan.

use std::collections::BTreeMap;
use std::fmt;

use arbor_core::{
    decode_inline_scalar, ArborResult, ChildSlot, NodeInfo, NodePath, NodeRecord, NodeType,
    RecordValue, Revision, Value,
};
use arbor_storage::StoreTransaction;
use tracing::warn;

/// Info of a single node: its own record, else its parent's inline slot
pub(crate) fn load_node_info(txn: &dyn StoreTransaction, path: &NodePath) -> ArborResult<NodeInfo> {
    if let Some(record) = txn.get(path)? {
        return Ok(NodeInfo::dedicated(path.clone(), &record));
    }
    match inline_slot(txn, path)? {
        Some(value) => {
            let node_type = value.node_type();
            let value = decode_inline_scalar(&value)?;
            Ok(NodeInfo::inline(path.clone(), node_type, value))
        }
        None => Ok(NodeInfo::not_found(path.clone())),
    }
}

fn inline_slot(
    txn: &dyn StoreTransaction,
    path: &NodePath,
) -> ArborResult<Option<arbor_core::StoredValue>> {
    let (Some(parent), Some(segment)) = (path.parent(), path.last_segment()) else {
        return Ok(None);
    };
    let parent_record = txn.get(&parent)?;
    Ok(match parent_record.as_ref().and_then(|r| r.child_slot(segment)) {
        Some(ChildSlot::Inline(stored)) => Some(stored.clone()),
        _ => None,
    })
}

/// Full value of a node, or `None` if it does not exist
pub(crate) fn load_value(txn: &dyn StoreTransaction, path: &NodePath) -> ArborResult<Option<Value>> {
    match txn.get(path)? {
        Some(record) => {
            let descendants = match record.value {
                RecordValue::Children(_) => txn.descendants_of(path, None)?.into_iter().collect(),
                RecordValue::Scalar(_) => BTreeMap::new(),
            };
            assemble(path, &record, &descendants).map(Some)
        }
        None => inline_slot(txn, path)?
            .map(|stored| decode_inline_scalar(&stored))
            .transpose(),
    }
}

fn assemble(
    path: &NodePath,
    record: &NodeRecord,
    records: &BTreeMap<NodePath, NodeRecord>,
) -> ArborResult<Value> {
    let children = match &record.value {
        RecordValue::Scalar(stored) => return decode_inline_scalar(stored),
        RecordValue::Children(children) => children,
    };

    let mut entries = Vec::with_capacity(children.len());
    for (segment, slot) in children {
        let value = match slot {
            ChildSlot::Inline(stored) => decode_inline_scalar(stored)?,
            ChildSlot::Dedicated => {
                let child_path = path.child(segment.clone());
                match records.get(&child_path) {
                    Some(child) => assemble(&child_path, child, records)?,
                    None => {
                        warn!(target: "arbor::store", path = %child_path, "Dedicated child record missing");
                        continue;
                    }
                }
            }
        };
        entries.push((segment, value));
    }

    Ok(match record.node_type {
        NodeType::Array => Value::Array(entries.into_iter().map(|(_, v)| v).collect()),
        _ => Value::Object(
            entries
                .into_iter()
                .map(|(segment, v)| (segment.as_key(), v))
                .collect(),
        ),
    })
}

/// Direct children of a node, in key order
///
/// Values are filled in only when `include_values` is set.
pub(crate) fn load_children(
    txn: &dyn StoreTransaction,
    path: &NodePath,
    include_values: bool,
) -> ArborResult<Vec<NodeInfo>> {
    let Some(record) = txn.get(path)? else {
        return Ok(Vec::new());
    };
    let Some(children) = record.children() else {
        return Ok(Vec::new());
    };

    let records: BTreeMap<NodePath, NodeRecord> = if include_values {
        txn.descendants_of(path, None)?.into_iter().collect()
    } else if children.values().any(ChildSlot::is_dedicated) {
        txn.children_of(path, None)?.into_iter().collect()
    } else {
        BTreeMap::new()
    };

    let mut infos = Vec::with_capacity(children.len());
    for (segment, slot) in children {
        let child_path = path.child(segment.clone());
        let info = match slot {
            ChildSlot::Inline(stored) => {
                let mut info = NodeInfo::inline(
                    child_path,
                    stored.node_type(),
                    decode_inline_scalar(stored)?,
                );
                if !include_values {
                    info.value = None;
                }
                info
            }
            ChildSlot::Dedicated => {
                let Some(child) = records.get(&child_path) else {
                    warn!(target: "arbor::store", path = %child_path, "Dedicated child record missing");
                    continue;
                };
                let mut info = NodeInfo::dedicated(child_path.clone(), child);
                if include_values {
                    info.value = Some(assemble(&child_path, child, &records)?);
                }
                info
            }
        };
        infos.push(info);
    }
    Ok(infos)
}

/// State of a node observed by the read step of a transaction
///
/// Holds the revision of the nearest record storing the node (the node's
/// own record, or the record of the ancestor that embeds it) together with
/// the value read. A later write asserting the checkpoint fails if either
/// changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    holder: NodePath,
    revision: Option<Revision>,
    revision_nr: u64,
    value: Option<Value>,
}

impl Checkpoint {
    /// Path of the record holding the node
    pub fn holder(&self) -> &NodePath {
        &self.holder
    }

    /// Value read at the checkpoint
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Consume the checkpoint, keeping the value read
    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    pub(crate) fn token(&self) -> String {
        match &self.revision {
            Some(revision) => format!("{}:{}", revision, self.revision_nr),
            None => "none".to_string(),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}@{}", self.holder, self.token())
    }
}

/// Capture the checkpoint of a node
pub(crate) fn read_checkpoint(txn: &dyn StoreTransaction, path: &NodePath) -> ArborResult<Checkpoint> {
    let mut holder = path.clone();
    let record = loop {
        if let Some(record) = txn.get(&holder)? {
            break Some(record);
        }
        match holder.parent() {
            Some(parent) => holder = parent,
            None => break None,
        }
    };
    Ok(Checkpoint {
        holder,
        revision: record.as_ref().map(|r| r.revision.clone()),
        revision_nr: record.as_ref().map_or(0, |r| r.revision_nr),
        value: load_value(txn, path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{encode_inline_scalar, PathSegment};
    use arbor_storage::{MemoryStore, RecordStore};

    fn p(s: &str) -> NodePath {
        s.parse().unwrap()
    }

    fn inline(value: impl Into<Value>) -> ChildSlot {
        ChildSlot::Inline(encode_inline_scalar(&value.into()).unwrap())
    }

    fn container(node_type: NodeType, children: Vec<(PathSegment, ChildSlot)>) -> NodeRecord {
        NodeRecord::create(node_type, RecordValue::Children(children.into_iter().collect()), 1)
    }

    /// root { users: dedicated { alice: dedicated { name: "Alice", tags: dedicated [x, y] }, n: 2 } }
    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.set(
            &NodePath::root(),
            &container(NodeType::Object, vec![(PathSegment::from_key("users"), ChildSlot::Dedicated)]),
        )
        .unwrap();
        txn.set(
            &p("users"),
            &container(
                NodeType::Object,
                vec![
                    (PathSegment::from_key("alice"), ChildSlot::Dedicated),
                    (PathSegment::from_key("n"), inline(2)),
                ],
            ),
        )
        .unwrap();
        txn.set(
            &p("users/alice"),
            &container(
                NodeType::Object,
                vec![
                    (PathSegment::from_key("name"), inline("Alice")),
                    (PathSegment::from_key("tags"), ChildSlot::Dedicated),
                ],
            ),
        )
        .unwrap();
        txn.set(
            &p("users/alice/tags"),
            &container(
                NodeType::Array,
                vec![(PathSegment::Index(0), inline("x")), (PathSegment::Index(1), inline("y"))],
            ),
        )
        .unwrap();
        txn.commit().unwrap();
        store
    }

    #[test]
    fn test_node_info_dedicated_inline_missing() {
        let store = seeded();
        let txn = store.begin().unwrap();

        let info = load_node_info(&*txn, &p("users/alice")).unwrap();
        assert!(info.is_dedicated());
        assert_eq!(info.revision_nr, 1);

        let info = load_node_info(&*txn, &p("users/alice/name")).unwrap();
        assert!(info.is_inline());
        assert_eq!(info.node_type, Some(NodeType::String));
        assert_eq!(info.value, Some(Value::from("Alice")));

        assert!(!load_node_info(&*txn, &p("users/bob")).unwrap().exists);
        assert!(!load_node_info(&*txn, &p("users/n/deeper")).unwrap().exists);
    }

    #[test]
    fn test_value_assembles_dedicated_descendants() {
        let store = seeded();
        let txn = store.begin().unwrap();
        let value = load_value(&*txn, &p("users")).unwrap().unwrap();
        let expected = Value::object_from([
            (
                "alice",
                Value::object_from([
                    ("name", Value::from("Alice")),
                    ("tags", Value::Array(vec![Value::from("x"), Value::from("y")])),
                ]),
            ),
            ("n", Value::Int(2)),
        ]);
        assert_eq!(value, expected);
        assert_eq!(load_value(&*txn, &p("users/n")).unwrap(), Some(Value::Int(2)));
        assert_eq!(load_value(&*txn, &p("nobody")).unwrap(), None);
    }

    #[test]
    fn test_children_listing() {
        let store = seeded();
        let txn = store.begin().unwrap();

        let children = load_children(&*txn, &p("users"), false).unwrap();
        let paths: Vec<String> = children.iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["users/alice", "users/n"]);
        assert!(children.iter().all(|c| c.value.is_none()));

        let children = load_children(&*txn, &p("users/alice"), true).unwrap();
        assert_eq!(children[0].value, Some(Value::from("Alice")));
        assert_eq!(
            children[1].value,
            Some(Value::Array(vec![Value::from("x"), Value::from("y")]))
        );
        assert!(load_children(&*txn, &p("users/n"), true).unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_holder() {
        let store = seeded();
        let txn = store.begin().unwrap();

        let checkpoint = read_checkpoint(&*txn, &p("users/n")).unwrap();
        assert_eq!(checkpoint.holder(), &p("users"));
        assert_eq!(checkpoint.value(), Some(&Value::Int(2)));
        assert!(checkpoint.token().ends_with(":1"));

        let checkpoint = read_checkpoint(&*txn, &p("users/bob/age")).unwrap();
        assert_eq!(checkpoint.holder(), &p("users"));
        assert_eq!(checkpoint.value(), None);
    }
}
