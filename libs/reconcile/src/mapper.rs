//! Mapping events of one kind onto reconcile keys of another.
//!
//! Mappers are pure functions of the event payload and the watch cache.
//! Owners are always resolved through a [`Store`] at mapping time; a
//! dependent only ever stores its owner's name and uid.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use nodepool_events::{Cluster, Resource, WatchEvent};
use nodepool_id::ObjectKey;

use crate::error::MappingError;
use crate::predicate::Predicate;
use crate::store::Store;

/// Translates an object into the keys it should trigger.
pub trait Mapper<S>: Send + Sync {
    fn map(&self, obj: &S) -> Result<BTreeSet<ObjectKey>, MappingError>;
}

impl<S, F> Mapper<S> for F
where
    F: Fn(&S) -> Result<BTreeSet<ObjectKey>, MappingError> + Send + Sync,
{
    fn map(&self, obj: &S) -> Result<BTreeSet<ObjectKey>, MappingError> {
        self(obj)
    }
}

/// Which side of an update a mapped handler looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    /// Map only the new object.
    #[default]
    UpdateWithNew,
    /// Map both old and new objects and enqueue the union.
    UpdateWithOldAndNew,
}

/// Decides which keys an event enqueues.
pub enum EventHandler<S> {
    /// Enqueue the event's own object.
    ForObject,
    /// Enqueue whatever the mapper returns.
    Mapped {
        mapper: Arc<dyn Mapper<S>>,
        mode: MapMode,
    },
}

impl<S: Resource> EventHandler<S> {
    pub fn mapped(mapper: impl Mapper<S> + 'static, mode: MapMode) -> Self {
        EventHandler::Mapped {
            mapper: Arc::new(mapper),
            mode,
        }
    }

    /// Keys the event should enqueue.
    pub fn keys(&self, event: &WatchEvent<S>) -> Result<BTreeSet<ObjectKey>, MappingError> {
        match self {
            EventHandler::ForObject => Ok(BTreeSet::from([event.key()])),
            EventHandler::Mapped { mapper, mode } => {
                let mut keys = mapper.map(event.object())?;
                if let (MapMode::UpdateWithOldAndNew, Some(old)) = (mode, event.old()) {
                    keys.extend(mapper.map(old)?);
                }
                Ok(keys)
            }
        }
    }
}

impl<S> Clone for EventHandler<S> {
    fn clone(&self) -> Self {
        match self {
            EventHandler::ForObject => EventHandler::ForObject,
            EventHandler::Mapped { mapper, mode } => EventHandler::Mapped {
                mapper: Arc::clone(mapper),
                mode: *mode,
            },
        }
    }
}

// =============================================================================
// Owner mapping
// =============================================================================

/// Maps a dependent object to the single owner of kind `O` it references.
///
/// Returns the empty set when the dependent has no owner reference of that
/// kind, when the owner is not in the cache, when the cached owner has a
/// different uid (the reference is stale), or when the owner fails
/// `predicate`.
pub struct OwnerMapper<O: Resource> {
    owners: Store<O>,
    predicate: Predicate,
}

impl<O: Resource> OwnerMapper<O> {
    pub fn new(owners: Store<O>, predicate: Predicate) -> Self {
        Self { owners, predicate }
    }
}

impl<O: Resource, S: Resource> Mapper<S> for OwnerMapper<O> {
    fn map(&self, obj: &S) -> Result<BTreeSet<ObjectKey>, MappingError> {
        let meta = obj.meta();
        let refs: Vec<_> = meta.owners_of_kind(O::KIND).collect();

        let owner_ref = match refs.as_slice() {
            [] => return Ok(BTreeSet::new()),
            [single] => *single,
            many => {
                let controllers: Vec<_> = many.iter().filter(|r| r.controller).collect();
                match controllers.as_slice() {
                    [single] => **single,
                    _ => {
                        return Err(MappingError::AmbiguousOwner {
                            object: meta.key(),
                            kind: O::KIND,
                            count: many.len(),
                        })
                    }
                }
            }
        };

        if owner_ref.name.is_empty() {
            return Err(MappingError::MalformedOwnerReference {
                object: meta.key(),
                reason: format!("{} owner reference has an empty name", O::KIND),
            });
        }

        let owner_key = ObjectKey::new(&meta.namespace, &owner_ref.name);
        let Some(owner) = self.owners.get(&owner_key) else {
            return Ok(BTreeSet::new());
        };

        if owner_ref.uid.is_some_and(|uid| uid != owner.meta().uid) {
            return Ok(BTreeSet::new());
        }

        if !self.predicate.evaluate_generic(owner.as_ref()) {
            return Ok(BTreeSet::new());
        }

        Ok(BTreeSet::from([owner_key]))
    }
}

// =============================================================================
// Tenant fan-out
// =============================================================================

/// Maps a cluster to every object of kind `O` in the cluster's namespace
/// that passes `predicate`.
pub struct TenantMapper<O: Resource> {
    objects: Store<O>,
    predicate: Predicate,
    _kind: PhantomData<fn() -> O>,
}

impl<O: Resource> TenantMapper<O> {
    pub fn new(objects: Store<O>, predicate: Predicate) -> Self {
        Self {
            objects,
            predicate,
            _kind: PhantomData,
        }
    }
}

impl<O: Resource> Mapper<Cluster> for TenantMapper<O> {
    fn map(&self, cluster: &Cluster) -> Result<BTreeSet<ObjectKey>, MappingError> {
        Ok(self
            .objects
            .list_namespace(&cluster.metadata.name)
            .iter()
            .filter(|obj| self.predicate.evaluate_generic(obj.as_ref()))
            .map(|obj| obj.key())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodepool_events::{Machine, MachineSet, OwnerReference, Worker};

    fn workers(items: &[&Worker]) -> Store<Worker> {
        let store = Store::new();
        for w in items {
            store.apply(&WatchEvent::Created((*w).clone()));
        }
        store
    }

    #[test]
    fn test_owner_mapper_resolves_owner() {
        let worker = Worker::new("shoot--a", "worker", "aws");
        let mapper = OwnerMapper::new(workers(&[&worker]), Predicate::has_type("aws"));

        let machine = Machine::new("shoot--a", "m-1", "set").owned_by(&worker);
        assert_eq!(
            mapper.map(&machine).unwrap(),
            BTreeSet::from([worker.key()])
        );

        let set = MachineSet::new("shoot--a", "set", "pool", 2).owned_by(&worker);
        assert_eq!(mapper.map(&set).unwrap(), BTreeSet::from([worker.key()]));
    }

    #[test]
    fn test_owner_mapper_empty_cases() {
        let worker = Worker::new("shoot--a", "worker", "aws");
        let store = workers(&[&worker]);

        // Unowned.
        let mapper = OwnerMapper::new(store.clone(), Predicate::Always);
        assert!(mapper.map(&Machine::new("shoot--a", "m", "set")).unwrap().is_empty());

        // Predicate rejects the owner.
        let rejecting = OwnerMapper::new(store.clone(), Predicate::has_type("gcp"));
        let machine = Machine::new("shoot--a", "m", "set").owned_by(&worker);
        assert!(rejecting.map(&machine).unwrap().is_empty());

        // Owner not cached.
        let gone = Worker::new("shoot--a", "gone", "aws");
        let orphan = Machine::new("shoot--a", "m", "set").owned_by(&gone);
        assert!(mapper.map(&orphan).unwrap().is_empty());

        // Stale uid: the owner was re-created under the same name.
        let recreated = Worker::new("shoot--a", "worker", "aws");
        let stale = Machine::new("shoot--a", "m", "set").owned_by(&recreated);
        assert!(mapper.map(&stale).unwrap().is_empty());
    }

    #[test]
    fn test_owner_mapper_malformed_reference() {
        let mapper = OwnerMapper::new(Store::<Worker>::new(), Predicate::Always);
        let mut machine = Machine::new("shoot--a", "m", "set");
        machine.metadata.owner_references.push(OwnerReference {
            kind: "Worker".to_string(),
            name: String::new(),
            uid: None,
            controller: true,
        });

        assert!(matches!(
            mapper.map(&machine),
            Err(MappingError::MalformedOwnerReference { .. })
        ));
    }

    #[test]
    fn test_owner_mapper_ambiguous_controllers() {
        let a = Worker::new("shoot--a", "a", "aws");
        let b = Worker::new("shoot--a", "b", "aws");
        let mapper = OwnerMapper::new(workers(&[&a, &b]), Predicate::Always);

        let machine = Machine::new("shoot--a", "m", "set").owned_by(&a).owned_by(&b);
        assert!(matches!(
            mapper.map(&machine),
            Err(MappingError::AmbiguousOwner { count: 2, .. })
        ));

        // A single controlling reference wins over plain references.
        let mut mixed = Machine::new("shoot--a", "m", "set").owned_by(&a);
        let mut plain = OwnerReference::controller_of(&b);
        plain.controller = false;
        mixed.metadata.owner_references.push(plain);
        assert_eq!(mapper.map(&mixed).unwrap(), BTreeSet::from([a.key()]));
    }

    #[test]
    fn test_tenant_mapper_fans_out_within_namespace() {
        let w1 = Worker::new("shoot--a", "w1", "aws");
        let w2 = Worker::new("shoot--a", "w2", "aws");
        let other_type = Worker::new("shoot--a", "w3", "gcp");
        let other_ns = Worker::new("shoot--b", "w1", "aws");
        let mapper = TenantMapper::new(
            workers(&[&w1, &w2, &other_type, &other_ns]),
            Predicate::has_type("aws"),
        );

        let keys = mapper.map(&Cluster::new("shoot--a")).unwrap();
        assert_eq!(keys, BTreeSet::from([w1.key(), w2.key()]));
    }

    #[test]
    fn test_handler_update_modes() {
        let a = Worker::new("shoot--a", "a", "aws");
        let b = Worker::new("shoot--a", "b", "aws");
        let store = workers(&[&a, &b]);

        let old = Machine::new("shoot--a", "m", "set").owned_by(&a);
        let mut new = old.clone();
        new.metadata.owner_references.clear();
        let new = new.owned_by(&b);
        let event = WatchEvent::Updated { old, new };

        let with_new = EventHandler::mapped(
            OwnerMapper::new(store.clone(), Predicate::Always),
            MapMode::UpdateWithNew,
        );
        assert_eq!(with_new.keys(&event).unwrap(), BTreeSet::from([b.key()]));

        let both = EventHandler::mapped(
            OwnerMapper::new(store, Predicate::Always),
            MapMode::UpdateWithOldAndNew,
        );
        assert_eq!(
            both.keys(&event).unwrap(),
            BTreeSet::from([a.key(), b.key()])
        );
    }

    #[test]
    fn test_handler_for_object_and_closure_mapper() {
        let worker = Worker::new("shoot--a", "w", "aws");
        let event = WatchEvent::Created(worker.clone());
        assert_eq!(
            EventHandler::ForObject.keys(&event).unwrap(),
            BTreeSet::from([worker.key()])
        );

        let fixed = ObjectKey::new("ns", "fixed");
        let expected = fixed.clone();
        let handler = EventHandler::mapped(
            move |_: &Worker| Ok(BTreeSet::from([fixed.clone()])),
            MapMode::UpdateWithNew,
        );
        assert_eq!(handler.keys(&event).unwrap(), BTreeSet::from([expected]));
    }
}
