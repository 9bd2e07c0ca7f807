//! Fixture builders for nodepool tests.
//!
//! Builders start from a valid, healthy object and let a test change only
//! what it cares about:
//!
//! ```ignore
//! let worker = WorkerBuilder::new("shoot--a", "worker")
//!     .annotated("reconcile")
//!     .pool("default", 1, 3)
//!     .build();
//! ```

use chrono::Utc;
use nodepool_events::{
    Cluster, ClusterPhase, LastOperation, LastOperationState, LastOperationType, Machine,
    MachinePhase, MachineSet, Worker, WorkerPool, OPERATION_ANNOTATION,
};

/// Backend type used when a test does not pick one.
pub const DEFAULT_TYPE: &str = "local";

/// Builds [`Worker`] fixtures.
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            worker: Worker::new(namespace, name, DEFAULT_TYPE),
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.worker.spec.kind = kind.to_string();
        self
    }

    pub fn region(mut self, region: &str) -> Self {
        self.worker.spec.region = region.to_string();
        self
    }

    pub fn pool(mut self, name: &str, minimum: u32, maximum: u32) -> Self {
        self.worker.spec.pools.push(WorkerPool {
            name: name.to_string(),
            machine_type: "m5.large".to_string(),
            minimum,
            maximum,
            zones: Vec::new(),
        });
        self
    }

    /// Sets the operation annotation to `operation`.
    pub fn annotated(mut self, operation: &str) -> Self {
        self.worker
            .metadata
            .annotations
            .insert(OPERATION_ANNOTATION.to_string(), operation.to_string());
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.worker.metadata.generation = generation;
        self
    }

    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.worker.metadata.finalizers.push(finalizer.to_string());
        self
    }

    /// Marks the worker as being deleted.
    pub fn deleting(mut self) -> Self {
        self.worker.metadata.deletion_timestamp = Some(Utc::now());
        self
    }

    pub fn last_operation(mut self, kind: LastOperationType, state: LastOperationState) -> Self {
        self.worker.status.last_operation = Some(LastOperation::new(kind, state, "fixture"));
        self
    }

    /// Shorthand for a worker whose last reconcile succeeded.
    pub fn reconciled(self) -> Self {
        let generation = self.worker.metadata.generation;
        let mut builder =
            self.last_operation(LastOperationType::Reconcile, LastOperationState::Succeeded);
        builder.worker.status.observed_generation = generation;
        builder
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

/// A machine set owned by `worker`.
pub fn machine_set(worker: &Worker, name: &str, pool: &str, replicas: u32) -> MachineSet {
    MachineSet::new(&worker.metadata.namespace, name, pool, replicas).owned_by(worker)
}

/// A machine owned by `worker`, created for `set`.
pub fn machine(
    worker: &Worker,
    set: &str,
    name: &str,
    phase: MachinePhase,
    node: Option<&str>,
) -> Machine {
    let mut machine = Machine::new(&worker.metadata.namespace, name, set).owned_by(worker);
    machine.status.phase = phase;
    machine.status.node = node.map(str::to_string);
    machine
}

/// The cluster of `namespace` in the given phase.
pub fn cluster(namespace: &str, phase: ClusterPhase) -> Cluster {
    let mut cluster = Cluster::new(namespace);
    cluster.status.phase = phase;
    cluster
}
