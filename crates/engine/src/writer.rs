//! Write engine
//!
//! A write runs in three phases:
//!
//! 1. **Validate** the value (root shape, void properties, keys, depth)
//!    before any lock is taken.
//! 2. **Bubble** under the write lock: while the target has no record of its
//!    own, or the new value belongs inline, the write is folded into a MERGE
//!    of `{key: value}` on the parent and the lock moves up one level.
//! 3. **Apply** the update to the target record in one store transaction.
//!    Children are written before their parent record; values that fit
//!    inline are embedded, others get (or keep) a dedicated record.
//!
//! Cache changes are collected while applying and only take effect after
//! the store transaction commits.

use std::collections::{BTreeMap, BTreeSet};

use arbor_core::{
    encode_inline_scalar, fits_inline, ArborError, ArborResult, ChildSlot, NodeInfo, NodePath,
    NodeRecord, NodeType, PathParseError, PathSegment, RecordValue, Value,
};
use arbor_concurrency::NodeLock;
use arbor_storage::StoreTransaction;
use tracing::{debug, warn};

use crate::cache::{CacheLookup, NodeInfoCache};
use crate::database::Database;
use crate::events::DispatchPlan;
use crate::reader::{self, Checkpoint};

/// How a value is applied to the existing node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Touch only the keys present in the new value; `null` deletes a key
    Merge,
    /// Replace the node; keys absent from the new value are deleted
    Overwrite,
}

/// Optional inputs of a write
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Context forwarded to subscribers with every event of this write
    pub context: Option<serde_json::Value>,
    /// Fail with `RevisionConflict` unless the node is still in this state
    pub assert: Option<Checkpoint>,
}

impl WriteOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a write context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Require the node to be unchanged since `checkpoint` was read
    pub fn with_assert(mut self, checkpoint: Checkpoint) -> Self {
        self.assert = Some(checkpoint);
        self
    }
}

#[derive(Debug)]
enum Update {
    Overwrite(Value),
    Merge(BTreeMap<PathSegment, Value>),
}

impl Update {
    fn new(value: Value, mode: WriteMode) -> Self {
        match (mode, value) {
            (WriteMode::Merge, Value::Object(map)) => Update::Merge(
                map.into_iter()
                    .map(|(key, value)| (PathSegment::from_key(&key), value))
                    .collect(),
            ),
            (_, value) => Update::Overwrite(value),
        }
    }
}

#[derive(Debug)]
enum CacheEffect {
    Updated(NodeInfo),
    Invalidated(NodePath),
    Deleted(NodePath),
}

struct WriteContext {
    now: i64,
    max_inline: usize,
    effects: Vec<CacheEffect>,
}

// ============================================================================
// Validation
// ============================================================================

fn validate(path: &NodePath, value: Value, remove_void: bool) -> ArborResult<Value> {
    path.validate()?;
    if path.has_wildcards() {
        return Err(PathParseError::WildcardNotAllowed(path.to_string()).into());
    }
    if path.is_root() {
        match &value {
            Value::Null => return Err(ArborError::invalid_value(path, "root cannot be removed")),
            Value::Object(_) => {}
            _ => {
                return Err(ArborError::invalid_value(
                    path,
                    format!("root value must be an object, got {}", value.type_name()),
                ))
            }
        }
    }
    if value.is_void() {
        return Err(ArborError::invalid_value(path, "value is undefined"));
    }
    value
        .validate_depth()
        .map_err(|e| ArborError::invalid_value(path, e.to_string()))?;
    clean(path, value, remove_void)
}

/// Check keys and strip or reject `Void` properties
fn clean(path: &NodePath, value: Value, remove_void: bool) -> ArborResult<Value> {
    match value {
        Value::Object(map) => {
            let mut cleaned = BTreeMap::new();
            for (key, child) in map {
                PathSegment::validate_key(&key)
                    .map_err(|reason| ArborError::invalid_value(path, reason))?;
                let child_path = path.child(PathSegment::from_key(&key));
                if child.is_void() {
                    if remove_void {
                        continue;
                    }
                    return Err(ArborError::invalid_value(&child_path, "property is undefined"));
                }
                cleaned.insert(key, clean(&child_path, child, remove_void)?);
            }
            Ok(Value::Object(cleaned))
        }
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let child_path = path.child(PathSegment::Index(i));
                if item.is_void() {
                    return Err(ArborError::invalid_value(&child_path, "array element is undefined"));
                }
                clean(&child_path, item, remove_void)
            })
            .collect::<ArborResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Array children must be exactly the indices `0..n`
fn check_array_keys<'a>(
    path: &NodePath,
    keys: impl IntoIterator<Item = &'a PathSegment>,
) -> ArborResult<()> {
    for (expected, segment) in keys.into_iter().enumerate() {
        match segment {
            PathSegment::Index(i) if *i == expected => {}
            PathSegment::Index(i) => {
                return Err(ArborError::ArrayContiguity {
                    path: path.clone(),
                    reason: format!("index {} leaves a gap at index {}", i, expected),
                })
            }
            other => {
                return Err(ArborError::invalid_value(
                    path,
                    format!("array key '{}' is not an index", other.as_key()),
                ))
            }
        }
    }
    Ok(())
}

/// Value resulting from merging `entries` into a node stored inline
fn materialize_merge(
    path: &NodePath,
    existing: Option<&Value>,
    entries: BTreeMap<PathSegment, Value>,
) -> ArborResult<Value> {
    let kept: BTreeMap<PathSegment, Value> =
        entries.into_iter().filter(|(_, v)| !v.is_null()).collect();
    if matches!(existing, Some(Value::Array(_))) {
        check_array_keys(path, kept.keys())?;
        Ok(Value::Array(kept.into_values().collect()))
    } else {
        Ok(Value::Object(
            kept.into_iter()
                .map(|(segment, v)| (segment.as_key(), v))
                .collect(),
        ))
    }
}

// ============================================================================
// Applying an update
// ============================================================================

fn write_node(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    update: Update,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    let old = txn.get(path)?;
    match update {
        Update::Overwrite(Value::Null) => delete_subtree(txn, path, cx),
        Update::Overwrite(value) => overwrite_node(txn, path, old, value, cx),
        Update::Merge(entries) => match old {
            Some(record) if record.children().is_some() => {
                merge_node(txn, path, record, entries, cx)
            }
            _ if entries.values().all(Value::is_null) => Ok(()),
            old => {
                let value = materialize_merge(path, None, entries)?;
                overwrite_node(txn, path, old, value, cx)
            }
        },
    }
}

fn overwrite_node(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    old: Option<NodeRecord>,
    value: Value,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    let node_type = value
        .node_type()
        .ok_or_else(|| ArborError::invalid_value(path, format!("{} cannot be stored", value.type_name())))?;
    let old_children = old.as_ref().and_then(NodeRecord::children);

    let record_value = if value.is_container() {
        let children: Vec<(PathSegment, &Value)> = value
            .children()
            .into_iter()
            .filter(|(_, child)| !child.is_null())
            .collect();
        if node_type == NodeType::Array {
            check_array_keys(path, children.iter().map(|(segment, _)| segment))?;
        }
        let new_keys: BTreeSet<&PathSegment> = children.iter().map(|(segment, _)| segment).collect();
        if let Some(old_children) = old_children {
            for (segment, slot) in old_children {
                if !new_keys.contains(segment) {
                    remove_child(txn, &path.child(segment.clone()), slot, cx)?;
                }
            }
        }

        let mut slots = BTreeMap::new();
        for (segment, child) in children {
            let old_slot = old_children.and_then(|c| c.get(&segment));
            let slot = write_child(txn, &path.child(segment.clone()), child.clone(), old_slot, cx)?;
            slots.insert(segment, slot);
        }
        RecordValue::Children(slots)
    } else {
        if let Some(old_children) = old_children {
            for (segment, slot) in old_children {
                remove_child(txn, &path.child(segment.clone()), slot, cx)?;
            }
        }
        let stored = encode_inline_scalar(&value)
            .ok_or_else(|| ArborError::invalid_value(path, "value has no scalar encoding"))?;
        RecordValue::Scalar(stored)
    };

    persist(txn, path, old.as_ref(), node_type, record_value, cx)
}

fn merge_node(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    record: NodeRecord,
    entries: BTreeMap<PathSegment, Value>,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    let mut slots = record.children().cloned().unwrap_or_default();

    if record.node_type == NodeType::Array {
        let mut keys: BTreeSet<&PathSegment> = slots.keys().collect();
        for (segment, value) in &entries {
            if value.is_null() {
                keys.remove(segment);
            } else {
                keys.insert(segment);
            }
        }
        check_array_keys(path, keys)?;
    }

    for (segment, value) in entries {
        let child_path = path.child(segment.clone());
        let old_slot = slots.remove(&segment);
        if value.is_null() {
            if let Some(slot) = &old_slot {
                remove_child(txn, &child_path, slot, cx)?;
            }
            continue;
        }
        let slot = write_child(txn, &child_path, value, old_slot.as_ref(), cx)?;
        slots.insert(segment, slot);
    }

    persist(
        txn,
        path,
        Some(&record),
        record.node_type,
        RecordValue::Children(slots),
        cx,
    )
}

/// Store a child inline if it fits, else as its own record
fn write_child(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    value: Value,
    old_slot: Option<&ChildSlot>,
    cx: &mut WriteContext,
) -> ArborResult<ChildSlot> {
    if fits_inline(&value, cx.max_inline) {
        if matches!(old_slot, Some(ChildSlot::Dedicated)) {
            delete_subtree(txn, path, cx)?;
        }
        let stored = encode_inline_scalar(&value)
            .ok_or_else(|| ArborError::invalid_value(path, "value has no inline encoding"))?;
        cx.effects.push(CacheEffect::Invalidated(path.clone()));
        Ok(ChildSlot::Inline(stored))
    } else {
        write_node(txn, path, Update::Overwrite(value), cx)?;
        Ok(ChildSlot::Dedicated)
    }
}

fn remove_child(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    slot: &ChildSlot,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    match slot {
        ChildSlot::Dedicated => delete_subtree(txn, path, cx),
        ChildSlot::Inline(_) => {
            cx.effects.push(CacheEffect::Deleted(path.clone()));
            Ok(())
        }
    }
}

fn delete_subtree(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    for (descendant, _) in txn.descendants_of(path, None)? {
        txn.remove(&descendant)?;
    }
    txn.remove(path)?;
    cx.effects.push(CacheEffect::Deleted(path.clone()));
    Ok(())
}

fn persist(
    txn: &mut (dyn StoreTransaction + '_),
    path: &NodePath,
    old: Option<&NodeRecord>,
    node_type: NodeType,
    value: RecordValue,
    cx: &mut WriteContext,
) -> ArborResult<()> {
    let record = match old {
        Some(old) => old.update(node_type, value, cx.now),
        None => NodeRecord::create(node_type, value, cx.now),
    };
    txn.set(path, &record)?;
    cx.effects
        .push(CacheEffect::Updated(NodeInfo::dedicated(path.clone(), &record)));
    Ok(())
}

fn apply_effects(cache: &NodeInfoCache, effects: Vec<CacheEffect>) {
    for effect in effects {
        match effect {
            CacheEffect::Updated(info) => cache.update(info),
            CacheEffect::Invalidated(path) => cache.invalidate(&path, true),
            CacheEffect::Deleted(path) => cache.mark_deleted(&path),
        }
    }
}

// ============================================================================
// Database entry point
// ============================================================================

impl Database {
    /// Write `value` at `path`
    ///
    /// Returns the info of the written node after the write.
    ///
    /// # Errors
    ///
    /// - `InvalidValue` / `InvalidPath` / `ArrayContiguity` for rejected input
    /// - `RevisionConflict` if `options.assert` no longer matches
    /// - `Store` if the record store fails (nothing is committed)
    /// - `LockExpired` if the write lock timed out before the commit
    ///
    /// Once the commit succeeded the write is reported as done, even if the
    /// lock expired before it could be released.
    pub async fn write(
        &self,
        path: NodePath,
        value: Value,
        mode: WriteMode,
        options: WriteOptions,
    ) -> ArborResult<NodeInfo> {
        let inner = &self.inner;
        let value = validate(&path, value, inner.config.remove_void_properties)?;
        let plan = DispatchPlan::new(&path, &inner.subscriptions, &inner.indexes);

        let tid = inner.locks.next_tid();
        let mut lock = inner.locks.lock(path.clone(), tid, true).await?;
        debug!(target: "arbor::write", tid = %tid, path = %path, ?mode, "Write started");

        let mut txn = inner.store.begin()?;
        let outcome = self
            .apply_locked(&mut *txn, &mut lock, &path, value, mode, &options, plan.as_ref())
            .await;
        let (target, effects, old_top) = match outcome {
            Ok(done) => done,
            Err(e) => {
                if let Err(rollback_err) = txn.rollback(&e.to_string()) {
                    warn!(target: "arbor::write", tid = %tid, error = %rollback_err, "Rollback failed");
                }
                inner.cache.invalidate(lock.path(), true);
                debug!(target: "arbor::write", tid = %tid, path = %path, error = %e, "Write failed");
                return Err(e);
            }
        };
        txn.commit()?;
        apply_effects(&inner.cache, effects);

        let (info, new_top) = {
            let read = inner.store.begin()?;
            let info = reader::load_node_info(&*read, &path)?;
            let new_top = match &plan {
                Some(plan) => reader::load_value(&*read, &plan.top)?,
                None => None,
            };
            read.commit()?;
            (info, new_top)
        };

        // Queued before the release so that writes dispatch in lock order
        let inline = plan.and_then(|plan| {
            let context = options.context.unwrap_or(serde_json::Value::Null);
            inner.dispatch.submit(Box::new(move || {
                plan.dispatch(old_top.as_ref(), new_top.as_ref(), &context)
            }))
        });

        if let Err(e) = lock.release() {
            warn!(
                target: "arbor::write",
                tid = %tid,
                path = %path,
                error = %e,
                "Write lock release failed after commit"
            );
        }
        debug!(target: "arbor::write", tid = %tid, path = %path, record = %target, "Write committed");

        if let Some(job) = inline {
            job();
        }
        Ok(info)
    }

    /// Bubble the write to the record that stores it and apply it there
    ///
    /// Returns the path of that record, the cache effects and the value at
    /// the top event path before the write.
    #[allow(clippy::too_many_arguments)]
    async fn apply_locked(
        &self,
        txn: &mut (dyn StoreTransaction + '_),
        lock: &mut NodeLock,
        path: &NodePath,
        value: Value,
        mode: WriteMode,
        options: &WriteOptions,
        plan: Option<&DispatchPlan>,
    ) -> ArborResult<(NodePath, Vec<CacheEffect>, Option<Value>)> {
        let inner = &self.inner;
        let max_inline = inner.config.max_inline_value_size;

        let old_top = match plan {
            Some(plan) => reader::load_value(&*txn, &plan.top)?,
            None => None,
        };

        if let Some(expected) = &options.assert {
            let current = reader::read_checkpoint(&*txn, path)?;
            if &current != expected {
                return Err(ArborError::RevisionConflict {
                    path: path.clone(),
                    expected: expected.token(),
                    found: current.token(),
                });
            }
        }

        let mut target = path.clone();
        let mut update = Update::new(value, mode);
        while let (Some(parent), Some(segment)) = (target.parent(), target.last_segment().cloned()) {
            let info = self.node_info_for_write(&*txn, &target)?;
            let bubble = match &update {
                Update::Overwrite(v) => !info.is_dedicated() || v.is_null() || fits_inline(v, max_inline),
                Update::Merge(_) => !info.is_dedicated(),
            };
            if !bubble {
                break;
            }
            let folded = match update {
                Update::Overwrite(v) => v,
                // Only deletions, and an inline node has no children to delete
                Update::Merge(entries) if entries.values().all(Value::is_null) => {
                    info.value.clone().unwrap_or(Value::Null)
                }
                Update::Merge(entries) => materialize_merge(&target, info.value.as_ref(), entries)?,
            };
            update = Update::Merge(BTreeMap::from([(segment, folded)]));
            lock.move_to_parent().await?;
            target = parent;
        }

        let mut cx = WriteContext {
            now: arbor_core::now_millis(),
            max_inline,
            effects: Vec::new(),
        };
        write_node(txn, &target, update, &mut cx)?;
        Ok((target, cx.effects, old_top))
    }

    fn node_info_for_write(
        &self,
        txn: &dyn StoreTransaction,
        path: &NodePath,
    ) -> ArborResult<NodeInfo> {
        if let CacheLookup::Hit(info) = self.inner.cache.find(path) {
            return Ok(info);
        }
        reader::load_node_info(txn, path)
    }
}
