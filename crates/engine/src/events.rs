//! Event and index dispatch
//!
//! Subscribers and indexes are external collaborators. The engine only
//! decides who is interested in a write, which subtree must be loaded to
//! serve them ("top event path"), and what changed.
//!
//! ## Flow of one write
//!
//! ```text
//! plan(write_path)            registries snapshot, top event path
//!   │
//!   ├─ load old value at top  (under the write lock)
//!   ├─ write + commit
//!   ├─ load new value at top  (under the write lock)
//!   ├─ queue dispatch(plan, old, new)  (still under the write lock)
//!   └─ release lock
//! ```
//!
//! Each database drains its queue on a single task, so subscribers see the
//! writes in the order they were made. Sink errors are logged and never
//! reach the writer.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::{NodePath, PathSegment, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::diff::{child_keys, compare_values, get_mutations, present, Mutation};

// ============================================================================
// Event types
// ============================================================================

/// Kind of change notification a subscription asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Value of the subscribed node changed
    Value,
    /// A child was added
    ChildAdded,
    /// A child changed
    ChildChanged,
    /// A child was removed
    ChildRemoved,
    /// One event per deepest changed path
    Mutated,
    /// One batch with all deepest changed paths
    Mutations,
    /// `value` without values
    NotifyValue,
    /// `child_added` without values
    NotifyChildAdded,
    /// `child_changed` without values
    NotifyChildChanged,
    /// `child_removed` without values
    NotifyChildRemoved,
    /// `mutated` without values
    NotifyMutated,
    /// `mutations` without values
    NotifyMutations,
}

impl EventType {
    /// Event name as used by subscribers
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Value => "value",
            EventType::ChildAdded => "child_added",
            EventType::ChildChanged => "child_changed",
            EventType::ChildRemoved => "child_removed",
            EventType::Mutated => "mutated",
            EventType::Mutations => "mutations",
            EventType::NotifyValue => "notify_value",
            EventType::NotifyChildAdded => "notify_child_added",
            EventType::NotifyChildChanged => "notify_child_changed",
            EventType::NotifyChildRemoved => "notify_child_removed",
            EventType::NotifyMutated => "notify_mutated",
            EventType::NotifyMutations => "notify_mutations",
        }
    }

    /// Whether subscribers receive paths only
    pub fn is_notify(self) -> bool {
        self != self.base()
    }

    /// The value-carrying event this type is based on
    pub fn base(self) -> EventType {
        match self {
            EventType::NotifyValue => EventType::Value,
            EventType::NotifyChildAdded => EventType::ChildAdded,
            EventType::NotifyChildChanged => EventType::ChildChanged,
            EventType::NotifyChildRemoved => EventType::ChildRemoved,
            EventType::NotifyMutated => EventType::Mutated,
            EventType::NotifyMutations => EventType::Mutations,
            other => other,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unknown event name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [EventType; 12] = [
            EventType::Value,
            EventType::ChildAdded,
            EventType::ChildChanged,
            EventType::ChildRemoved,
            EventType::Mutated,
            EventType::Mutations,
            EventType::NotifyValue,
            EventType::NotifyChildAdded,
            EventType::NotifyChildChanged,
            EventType::NotifyChildRemoved,
            EventType::NotifyMutated,
            EventType::NotifyMutations,
        ];
        ALL.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Failure reported by a subscription or index sink
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    /// Create a sink error from a message
    pub fn new(message: impl Into<String>) -> Self {
        SinkError(message.into())
    }
}

/// Result of delivering to a sink
pub type SinkResult = Result<(), SinkError>;

/// Standard event delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event kind
    pub event_type: EventType,
    /// Pattern the subscription was registered with
    pub subscription_path: NodePath,
    /// Concrete path the event is about
    pub path: NodePath,
    /// Value before the write
    pub old: Option<Value>,
    /// Value after the write
    pub new: Option<Value>,
    /// Context supplied by the writer
    pub context: serde_json::Value,
}

/// Batch of mutations delivered to a `mutations` subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatch {
    /// Pattern the subscription was registered with
    pub subscription_path: NodePath,
    /// Concrete subscribed path
    pub path: NodePath,
    /// Deepest changed paths
    pub mutations: Vec<Mutation>,
    /// Context supplied by the writer
    pub context: serde_json::Value,
}

/// Receiver of change notifications
///
/// Every method has a no-op default, so a sink only implements what its
/// subscriptions use.
pub trait SubscriptionSink: Send + Sync {
    /// `value`, `child_*` and `mutated` events
    fn on_event(&self, event: &Event) -> SinkResult {
        let _ = event;
        Ok(())
    }

    /// `mutations` batches
    fn on_mutations(&self, batch: &MutationBatch) -> SinkResult {
        let _ = batch;
        Ok(())
    }

    /// Path-only `notify_*` events
    fn on_notify(
        &self,
        event_type: EventType,
        subscription_path: &NodePath,
        path: &NodePath,
    ) -> SinkResult {
        let _ = (event_type, subscription_path, path);
        Ok(())
    }
}

/// Secondary index maintained from writes
///
/// An index declared on `users` indexes the records `users/*`.
pub trait IndexSink: Send + Sync {
    /// Pattern of the indexed collection
    fn path(&self) -> &NodePath;

    /// A record of the collection changed
    fn handle_record_update(
        &self,
        path: &NodePath,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> SinkResult;
}

fn record_pattern(index: &dyn IndexSink) -> NodePath {
    index.path().child(PathSegment::Wildcard("*".to_string()))
}

// ============================================================================
// Registries
// ============================================================================

/// Handle of a registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handle of a registered index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId(u64);

#[derive(Clone)]
pub(crate) struct Subscription {
    id: SubscriptionId,
    pattern: NodePath,
    event_type: EventType,
    sink: Arc<dyn SubscriptionSink>,
}

fn interested(pattern: &NodePath, write_path: &NodePath) -> bool {
    pattern.matches_prefix_of(write_path) || pattern.extends(write_path)
}

/// Registered subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `sink` to `event_type` events on `pattern`
    ///
    /// The pattern may contain wildcard segments (`*` or `$name`).
    pub fn subscribe(
        &self,
        pattern: NodePath,
        event_type: EventType,
        sink: Arc<dyn SubscriptionSink>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(target: "arbor::events", pattern = %pattern, event = %event_type, "Subscription added");
        self.entries.write().push(Subscription {
            id,
            pattern,
            event_type,
            sink,
        });
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    /// Number of subscriptions
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn interested_in(&self, write_path: &NodePath) -> Vec<Subscription> {
        self.entries
            .read()
            .iter()
            .filter(|s| interested(&s.pattern, write_path))
            .cloned()
            .collect()
    }
}

/// Registered indexes
#[derive(Default)]
pub struct IndexRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<(IndexId, Arc<dyn IndexSink>)>>,
}

impl IndexRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index
    pub fn add(&self, index: Arc<dyn IndexSink>) -> IndexId {
        let id = IndexId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(target: "arbor::events", path = %index.path(), "Index added");
        self.entries.write().push((id, index));
        id
    }

    /// Remove an index; returns whether it existed
    pub fn remove(&self, id: IndexId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(other, _)| *other != id);
        entries.len() != before
    }

    /// Number of indexes
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if there are no indexes
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn interested_in(&self, write_path: &NodePath) -> Vec<Arc<dyn IndexSink>> {
        self.entries
            .read()
            .iter()
            .filter(|(_, index)| interested(&record_pattern(index.as_ref()), write_path))
            .map(|(_, index)| Arc::clone(index))
            .collect()
    }
}

// ============================================================================
// Planning and dispatch
// ============================================================================

/// Shallowest path whose value covers every pattern interested in a write
///
/// Patterns at or above the write path resolve to the matching ancestor;
/// patterns below it are covered by the write path itself.
pub fn top_event_path<'a>(
    write_path: &NodePath,
    patterns: impl IntoIterator<Item = &'a NodePath>,
) -> Option<NodePath> {
    patterns
        .into_iter()
        .filter(|pattern| interested(pattern, write_path))
        .map(|pattern| {
            pattern
                .resolve_against(write_path)
                .unwrap_or_else(|| write_path.clone())
        })
        .min_by_key(NodePath::len)
}

/// Everything needed to notify collaborators about one write
pub(crate) struct DispatchPlan {
    pub(crate) top: NodePath,
    subscriptions: Vec<Subscription>,
    indexes: Vec<Arc<dyn IndexSink>>,
}

impl DispatchPlan {
    /// Snapshot the sinks interested in a write to `write_path`
    pub(crate) fn new(
        write_path: &NodePath,
        subscriptions: &SubscriptionRegistry,
        indexes: &IndexRegistry,
    ) -> Option<Self> {
        let subscriptions = subscriptions.interested_in(write_path);
        let indexes = indexes.interested_in(write_path);
        let index_patterns: Vec<NodePath> =
            indexes.iter().map(|i| record_pattern(i.as_ref())).collect();
        let top = top_event_path(
            write_path,
            subscriptions
                .iter()
                .map(|s| &s.pattern)
                .chain(index_patterns.iter()),
        )?;
        Some(DispatchPlan {
            top,
            subscriptions,
            indexes,
        })
    }

    /// Deliver events and index updates for the values before and after
    pub(crate) fn dispatch(
        &self,
        old_top: Option<&Value>,
        new_top: Option<&Value>,
        context: &serde_json::Value,
    ) {
        debug!(
            target: "arbor::events",
            top = %self.top,
            subscriptions = self.subscriptions.len(),
            indexes = self.indexes.len(),
            "Dispatching write events"
        );

        for subscription in &self.subscriptions {
            for path in expand(&subscription.pattern, &self.top, old_top, new_top) {
                let (old, new) = self.values_at(&path, old_top, new_top);
                if let Err(e) = emit(subscription, &path, old, new, context) {
                    error!(
                        target: "arbor::events",
                        pattern = %subscription.pattern,
                        path = %path,
                        event = %subscription.event_type,
                        error = %e,
                        "Subscriber failed"
                    );
                }
            }
        }

        for index in &self.indexes {
            for path in expand(&record_pattern(index.as_ref()), &self.top, old_top, new_top) {
                let (old, new) = self.values_at(&path, old_top, new_top);
                if compare_values(old, new).is_identical() {
                    continue;
                }
                if let Err(e) = index.handle_record_update(&path, present(old), present(new)) {
                    error!(
                        target: "arbor::events",
                        index = %index.path(),
                        path = %path,
                        error = %e,
                        "Index update failed"
                    );
                }
            }
        }
    }

    fn values_at<'v>(
        &self,
        path: &NodePath,
        old_top: Option<&'v Value>,
        new_top: Option<&'v Value>,
    ) -> (Option<&'v Value>, Option<&'v Value>) {
        let relative = path.relative_to(&self.top).unwrap_or(&[]);
        (
            old_top.and_then(|v| v.get_relative(relative)),
            new_top.and_then(|v| v.get_relative(relative)),
        )
    }
}

/// Concrete paths below `top` matched by `pattern`
///
/// Wildcards expand to the union of child keys present before or after.
fn expand(
    pattern: &NodePath,
    top: &NodePath,
    old: Option<&Value>,
    new: Option<&Value>,
) -> Vec<NodePath> {
    if pattern.len() < top.len() || !pattern.truncate(top.len()).matches(top) {
        return Vec::new();
    }
    let mut out = Vec::new();
    expand_from(top.clone(), &pattern.segments()[top.len()..], old, new, &mut out);
    out
}

fn expand_from(
    current: NodePath,
    rest: &[PathSegment],
    old: Option<&Value>,
    new: Option<&Value>,
    out: &mut Vec<NodePath>,
) {
    let Some((first, tail)) = rest.split_first() else {
        out.push(current);
        return;
    };
    if first.is_wildcard() {
        for key in child_keys(old, new) {
            let (o, n) = (old.and_then(|v| v.child(&key)), new.and_then(|v| v.child(&key)));
            expand_from(current.child(key), tail, o, n, out);
        }
    } else {
        let (o, n) = (old.and_then(|v| v.child(first)), new.and_then(|v| v.child(first)));
        expand_from(current.child(first.clone()), tail, o, n, out);
    }
}

fn emit(
    subscription: &Subscription,
    path: &NodePath,
    old: Option<&Value>,
    new: Option<&Value>,
    context: &serde_json::Value,
) -> SinkResult {
    let event_type = subscription.event_type;
    let deliver = |at: &NodePath, old: Option<&Value>, new: Option<&Value>| {
        if event_type.is_notify() {
            subscription
                .sink
                .on_notify(event_type, &subscription.pattern, at)
        } else {
            subscription.sink.on_event(&Event {
                event_type,
                subscription_path: subscription.pattern.clone(),
                path: at.clone(),
                old: old.cloned(),
                new: new.cloned(),
                context: context.clone(),
            })
        }
    };

    match event_type.base() {
        EventType::Value => {
            if !compare_values(old, new).is_identical() {
                deliver(path, present(old), present(new))?;
            }
        }
        base @ (EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved) => {
            let (old, new) = (present(old), present(new));
            for key in child_keys(old, new) {
                let before = present(old.and_then(|v| v.child(&key)));
                let after = present(new.and_then(|v| v.child(&key)));
                let kind = match (before, after) {
                    (None, Some(_)) => EventType::ChildAdded,
                    (Some(_), None) => EventType::ChildRemoved,
                    (Some(b), Some(a)) if !compare_values(Some(b), Some(a)).is_identical() => {
                        EventType::ChildChanged
                    }
                    _ => continue,
                };
                if kind == base {
                    deliver(&path.child(key), before, after)?;
                }
            }
        }
        EventType::Mutated => {
            for mutation in get_mutations(path, old, new) {
                deliver(&mutation.path, mutation.old.as_ref(), mutation.new.as_ref())?;
            }
        }
        EventType::Mutations => {
            let mutations = get_mutations(path, old, new);
            if !mutations.is_empty() {
                if event_type.is_notify() {
                    subscription
                        .sink
                        .on_notify(event_type, &subscription.pattern, path)?;
                } else {
                    subscription.sink.on_mutations(&MutationBatch {
                        subscription_path: subscription.pattern.clone(),
                        path: path.clone(),
                        mutations,
                        context: context.clone(),
                    })?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

// ============================================================================
// Dispatch queue
// ============================================================================

/// Deferred dispatch work of one write
pub(crate) type DispatchJob = Box<dyn FnOnce() + Send>;

/// Per-database queue running dispatch jobs one at a time, in submit order
///
/// The drain task is spawned on the runtime of the first submit, and again
/// whenever the previous one is gone because its runtime shut down.
#[derive(Default)]
pub(crate) struct DispatchQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<DispatchJob>>>,
}

impl DispatchQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind every earlier one
    ///
    /// Outside a tokio runtime the job is handed back to be run inline.
    pub(crate) fn submit(&self, job: DispatchJob) -> Option<DispatchJob> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Some(job);
        };
        let mut sender = self.sender.lock();
        let job = match sender.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!(target: "arbor::events", "Dispatch queue closed");
        });
        debug!(target: "arbor::events", "Dispatch queue started");

        match tx.send(job) {
            Ok(()) => {
                *sender = Some(tx);
                None
            }
            Err(mpsc::error::SendError(job)) => {
                *sender = None;
                Some(job)
            }
        }
    }
}
