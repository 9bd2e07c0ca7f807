//! Watch cache with lookups by key, namespace and owner.
//!
//! Reconcile loops, predicates and mappers only read from a [`Store`]. The
//! watch delivery side keeps it current through [`Store::apply`] before it
//! forwards each event, so a handler always sees a cache at least as new as
//! the event it is processing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nodepool_events::{Resource, WatchEvent};
use nodepool_id::ObjectKey;

/// Shared, cloneable handle to a cache of one resource kind.
pub struct Store<K: Resource> {
    inner: Arc<RwLock<StoreInner<K>>>,
}

struct StoreInner<K> {
    objects: BTreeMap<ObjectKey, Arc<K>>,
    /// (owner kind, owner key) -> keys of owned objects.
    by_owner: HashMap<(String, ObjectKey), BTreeSet<ObjectKey>>,
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                objects: BTreeMap::new(),
                by_owner: HashMap::new(),
            })),
        }
    }

    // Writers only insert or remove whole entries, so a poisoned lock still
    // guards consistent maps.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().objects.values().cloned().collect()
    }

    /// All objects in `namespace`, ordered by name.
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.read()
            .objects
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, obj)| Arc::clone(obj))
            .collect()
    }

    /// Objects carrying an owner reference to `owner_kind` at `owner`.
    pub fn list_owned_by(&self, owner_kind: &str, owner: &ObjectKey) -> Vec<Arc<K>> {
        let inner = self.read();
        let Some(keys) = inner.by_owner.get(&(owner_kind.to_string(), owner.clone())) else {
            return Vec::new();
        };

        keys.iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    /// Applies a watch event to the cache.
    pub fn apply(&self, event: &WatchEvent<K>) {
        match event {
            WatchEvent::Created(obj) | WatchEvent::Generic(obj) => self.upsert(obj.clone()),
            WatchEvent::Updated { new, .. } => self.upsert(new.clone()),
            WatchEvent::Deleted(obj) => self.remove(&obj.key()),
        }
    }

    fn upsert(&self, obj: K) {
        let key = obj.key();
        let mut inner = self.write();

        if let Some(previous) = inner.objects.remove(&key) {
            unindex(&mut inner.by_owner, &key, previous.as_ref());
        }

        for owner in &obj.meta().owner_references {
            let owner_key = ObjectKey::new(&obj.meta().namespace, &owner.name);
            inner
                .by_owner
                .entry((owner.kind.clone(), owner_key))
                .or_default()
                .insert(key.clone());
        }

        inner.objects.insert(key, Arc::new(obj));
    }

    fn remove(&self, key: &ObjectKey) {
        let mut inner = self.write();
        if let Some(previous) = inner.objects.remove(key) {
            unindex(&mut inner.by_owner, key, previous.as_ref());
        }
    }
}

fn unindex<K: Resource>(
    by_owner: &mut HashMap<(String, ObjectKey), BTreeSet<ObjectKey>>,
    key: &ObjectKey,
    obj: &K,
) {
    for owner in &obj.meta().owner_references {
        let index_key = (
            owner.kind.clone(),
            ObjectKey::new(&obj.meta().namespace, &owner.name),
        );
        if let Some(owned) = by_owner.get_mut(&index_key) {
            owned.remove(key);
            if owned.is_empty() {
                by_owner.remove(&index_key);
            }
        }
    }
}

impl<K: Resource> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &K::KIND)
            .field("len", &self.len())
            .finish()
    }
}
