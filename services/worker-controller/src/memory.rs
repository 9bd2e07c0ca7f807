//! In-memory object API for development and tests.
//!
//! A [`Tracker`] holds every object of one kind, assigns server-owned
//! metadata (resource version, generation, timestamps) and fans changes out
//! to watch streams. [`InMemoryApi`] bundles one tracker per kind and
//! implements [`WorkerApi`] on top of them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use nodepool_events::{
    Cluster, Machine, MachineSet, Resource, WatchEvent, Worker, WorkerState, OPERATION_ANNOTATION,
};
use nodepool_id::ObjectKey;
use nodepool_reconcile::Store;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use crate::api::{ApiError, Informer, OperationStatus, WorkerApi};
use crate::controller::Informers;

// =============================================================================
// Tracker
// =============================================================================

/// Object storage and change feed for one resource kind.
pub struct Tracker<K: Resource> {
    store: Store<K>,
    inner: Mutex<TrackerInner<K>>,
}

struct TrackerInner<K> {
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent<K>>>,
    resource_version: u64,
}

impl<K: Resource> Tracker<K> {
    pub fn new() -> Self {
        Self {
            store: Store::new(),
            inner: Mutex::new(TrackerInner {
                subscribers: Vec::new(),
                resource_version: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(key: &ObjectKey) -> ApiError {
        ApiError::NotFound {
            kind: K::KIND,
            key: key.clone(),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> {
        self.store.get(key).map(|obj| (*obj).clone())
    }

    pub fn list(&self) -> Vec<K> {
        self.store.list().iter().map(|obj| (**obj).clone()).collect()
    }

    /// Stores a new object.
    pub fn create(&self, mut obj: K) -> Result<K, ApiError> {
        let key = obj.key();
        let mut inner = self.lock();
        if self.store.get(&key).is_some() {
            return Err(ApiError::AlreadyExists { kind: K::KIND, key });
        }

        inner.resource_version += 1;
        let meta = obj.meta_mut();
        meta.resource_version = inner.resource_version;
        meta.generation = 1;
        meta.creation_timestamp.get_or_insert_with(Utc::now);

        self.publish(&mut inner, WatchEvent::Created(obj.clone()));
        Ok(obj)
    }

    /// Replaces an object. Server-owned metadata is kept; the generation
    /// is bumped when anything outside `metadata` and `status` changed.
    pub fn update(&self, obj: K) -> Result<K, ApiError> {
        let key = obj.key();
        self.modify(&key, move |current| *current = obj)
    }

    /// Read-modify-write of a single object.
    ///
    /// Writes that change nothing are not published. A deleting object left
    /// without finalizers is removed.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Result<K, ApiError> {
        let mut inner = self.lock();
        let old = self
            .store
            .get(key)
            .map(|obj| (*obj).clone())
            .ok_or_else(|| Self::not_found(key))?;

        let mut new = old.clone();
        f(&mut new);

        {
            let (old_meta, meta) = (old.meta(), new.meta_mut());
            meta.name = old_meta.name.clone();
            meta.namespace = old_meta.namespace.clone();
            meta.uid = old_meta.uid;
            meta.creation_timestamp = old_meta.creation_timestamp;
            meta.deletion_timestamp = old_meta.deletion_timestamp;
            meta.resource_version = old_meta.resource_version;
            meta.generation = old_meta.generation;
        }

        if new == old {
            return Ok(old);
        }

        if spec_of(&old) != spec_of(&new) {
            new.meta_mut().generation += 1;
        }
        inner.resource_version += 1;
        new.meta_mut().resource_version = inner.resource_version;

        if new.meta().is_deleting() && new.meta().finalizers.is_empty() {
            self.publish(&mut inner, WatchEvent::Deleted(new.clone()));
        } else {
            self.publish(
                &mut inner,
                WatchEvent::Updated {
                    old,
                    new: new.clone(),
                },
            );
        }
        Ok(new)
    }

    /// Requests deletion. Objects with finalizers only get a deletion
    /// timestamp and a generation bump; the rest are removed right away.
    pub fn delete(&self, key: &ObjectKey) -> Result<(), ApiError> {
        let mut inner = self.lock();
        let current = self
            .store
            .get(key)
            .map(|obj| (*obj).clone())
            .ok_or_else(|| Self::not_found(key))?;

        if current.meta().finalizers.is_empty() {
            self.publish(&mut inner, WatchEvent::Deleted(current));
            return Ok(());
        }
        if current.meta().is_deleting() {
            return Ok(());
        }

        let mut new = current.clone();
        inner.resource_version += 1;
        let meta = new.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.generation += 1;
        meta.resource_version = inner.resource_version;

        self.publish(&mut inner, WatchEvent::Updated { old: current, new });
        Ok(())
    }

    /// Re-delivers the current state of every object as a generic event.
    pub fn resync(&self) {
        let mut inner = self.lock();
        for obj in self.store.list() {
            self.publish(&mut inner, WatchEvent::Generic((*obj).clone()));
        }
    }

    fn publish(&self, inner: &mut TrackerInner<K>, event: WatchEvent<K>) {
        trace!(
            kind = K::KIND,
            object = %event.key(),
            event = %event.kind(),
            "Publishing watch event"
        );
        self.store.apply(&event);
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<K: Resource> Default for Tracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Informer<K> for Tracker<K> {
    fn store(&self) -> Store<K> {
        self.store.clone()
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for obj in self.store.list() {
            // The receiver is alive until this function returns.
            let _ = tx.send(WatchEvent::Created((*obj).clone()));
        }
        inner.subscribers.push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

fn spec_of<K: Resource>(obj: &K) -> Option<Value> {
    let mut value = serde_json::to_value(obj).ok()?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("metadata");
        fields.remove("status");
    }
    Some(value)
}

// =============================================================================
// In-memory API
// =============================================================================

/// One tracker per watched kind.
#[derive(Clone, Default)]
pub struct InMemoryApi {
    pub workers: Arc<Tracker<Worker>>,
    pub machine_sets: Arc<Tracker<MachineSet>>,
    pub machines: Arc<Tracker<Machine>>,
    pub clusters: Arc<Tracker<Cluster>>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch sources backed by this API's trackers.
    pub fn informers(&self) -> Informers {
        Informers {
            workers: self.workers.clone(),
            clusters: self.clusters.clone(),
            machine_sets: self.machine_sets.clone(),
            machines: self.machines.clone(),
        }
    }
}

#[async_trait]
impl WorkerApi for InMemoryApi {
    async fn update_operation_status(
        &self,
        key: &ObjectKey,
        status: OperationStatus,
    ) -> Result<(), ApiError> {
        self.workers.modify(key, |w| {
            w.status.phase = Some(status.phase);
            w.status.last_operation = Some(status.last_operation);
            w.status.last_error = status.last_error;
            if let Some(generation) = status.observed_generation {
                w.status.observed_generation = generation;
            }
            if let Some(provider_status) = status.provider_status {
                w.status.provider_status = Some(provider_status);
            }
        })?;
        Ok(())
    }

    async fn update_state(&self, key: &ObjectKey, state: WorkerState) -> Result<(), ApiError> {
        self.workers.modify(key, |w| w.status.state = Some(state))?;
        Ok(())
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), ApiError> {
        self.workers.modify(key, |w| {
            if !w.metadata.has_finalizer(finalizer) {
                w.metadata.finalizers.push(finalizer.to_string());
            }
        })?;
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), ApiError> {
        self.workers
            .modify(key, |w| w.metadata.finalizers.retain(|f| f != finalizer))?;
        Ok(())
    }

    async fn remove_operation_annotation(&self, key: &ObjectKey) -> Result<(), ApiError> {
        self.workers.modify(key, |w| {
            w.metadata.annotations.remove(OPERATION_ANNOTATION);
        })?;
        Ok(())
    }
}
