//! Event predicates.
//!
//! A [`Predicate`] is a small expression tree deciding whether a watch event
//! may produce reconcile requests. Trees compose with [`Predicate::And`] and
//! [`Predicate::Or`], both of which short-circuit.
//!
//! Predicates never fail. Anything that cannot be evaluated keeps the event.

use nodepool_events::{Cluster, EventKind, Resource, WatchEvent};
use nodepool_id::ObjectKey;
use serde_json::Value;

use crate::store::Store;

/// Boolean filter over watch events.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Keeps every event.
    Always,

    /// Keeps events whose object's type discriminator equals the value.
    /// Kinds without a discriminator never match.
    HasType(String),

    /// Keeps updates only when the new object carries the operation
    /// annotation. Create, delete and generic events are always kept.
    OperationAnnotation,

    /// Keeps updates only when `metadata.generation` changed.
    GenerationChanged,

    /// Drops events of objects whose cluster is marked failed. Objects
    /// without a known cluster are kept.
    ClusterNotFailed(Store<Cluster>),

    /// Keeps updates only when the value at the JSON pointer differs between
    /// old and new. A pointer missing on either side counts as changed.
    FieldChanged(String),

    /// Keeps create and generic events whose last operation did not succeed.
    LastOperationNotSuccessful,

    /// Keeps events whose object carries a deletion timestamp. Updates are
    /// kept only when that timestamp was just set, so writes to an object
    /// that is already deleting do not retrigger it.
    IsDeleting,

    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Borrowed view of an event, so generic evaluation needs no clone.
struct EventView<'a, K> {
    kind: EventKind,
    old: Option<&'a K>,
    new: &'a K,
}

impl Predicate {
    pub fn has_type(kind: impl Into<String>) -> Self {
        Predicate::HasType(kind.into())
    }

    pub fn field_changed(pointer: impl Into<String>) -> Self {
        Predicate::FieldChanged(pointer.into())
    }

    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And(predicates.into_iter().collect())
    }

    pub fn any(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or(predicates.into_iter().collect())
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Returns `self AND other`, flattening nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut preds) => {
                preds.push(other);
                Predicate::And(preds)
            }
            Predicate::Always => other,
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluates the predicate against a watch event.
    pub fn evaluate<K: Resource>(&self, event: &WatchEvent<K>) -> bool {
        self.eval(&EventView {
            kind: event.kind(),
            old: event.old(),
            new: event.object(),
        })
    }

    /// Evaluates the predicate as if `obj` arrived in a generic event.
    pub fn evaluate_generic<K: Resource>(&self, obj: &K) -> bool {
        self.eval(&EventView {
            kind: EventKind::Generic,
            old: None,
            new: obj,
        })
    }

    fn eval<K: Resource>(&self, ev: &EventView<'_, K>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::HasType(kind) => ev.new.extension_type() == Some(kind.as_str()),
            Predicate::OperationAnnotation => match ev.kind {
                EventKind::Updated => ev.new.meta().operation_annotation().is_some(),
                EventKind::Created | EventKind::Deleted | EventKind::Generic => true,
            },
            Predicate::GenerationChanged => match ev.old {
                Some(old) => old.meta().generation != ev.new.meta().generation,
                None => true,
            },
            Predicate::ClusterNotFailed(clusters) => {
                let cluster_key = ObjectKey::new("", &ev.new.meta().namespace);
                !clusters.get(&cluster_key).is_some_and(|c| c.is_failed())
            }
            Predicate::FieldChanged(pointer) => match ev.old {
                Some(old) => field_changed(pointer, old, ev.new),
                None => true,
            },
            Predicate::LastOperationNotSuccessful => match ev.kind {
                EventKind::Created | EventKind::Generic => ev
                    .new
                    .last_operation()
                    .is_some_and(|op| !op.is_succeeded()),
                EventKind::Updated | EventKind::Deleted => false,
            },
            Predicate::IsDeleting => match ev.old {
                Some(old) => !old.meta().is_deleting() && ev.new.meta().is_deleting(),
                None => ev.new.meta().is_deleting(),
            },
            Predicate::Not(inner) => !inner.eval(ev),
            Predicate::And(preds) => preds.iter().all(|p| p.eval(ev)),
            Predicate::Or(preds) => preds.iter().any(|p| p.eval(ev)),
        }
    }
}

fn field_changed<K: Resource>(pointer: &str, old: &K, new: &K) -> bool {
    match (lookup(old, pointer), lookup(new, pointer)) {
        (Some(before), Some(after)) => before != after,
        _ => true,
    }
}

fn lookup<K: Resource>(obj: &K, pointer: &str) -> Option<Value> {
    let value = serde_json::to_value(obj).ok()?;
    value.pointer(pointer).cloned()
}

/// Default event predicates for a primary resource controller.
///
/// With the operation annotation ignored, any spec change (generation bump)
/// triggers a reconcile. Otherwise only annotated updates, deletions and
/// unfinished operations do. Both variants drop events of failed clusters.
pub fn default_controller_predicates(
    ignore_operation_annotation: bool,
    clusters: Store<Cluster>,
) -> Predicate {
    let trigger = if ignore_operation_annotation {
        Predicate::GenerationChanged
    } else {
        Predicate::any([
            Predicate::OperationAnnotation,
            Predicate::LastOperationNotSuccessful,
            Predicate::IsDeleting,
        ])
    };

    Predicate::all([Predicate::ClusterNotFailed(clusters), trigger])
}

/// Restricts `predicate` to objects of the given backend type.
pub fn add_type_predicate(predicate: Predicate, kind: impl Into<String>) -> Predicate {
    predicate.and(Predicate::has_type(kind))
}
