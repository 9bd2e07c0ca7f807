//! Shared harness for worker controller integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodepool_events::{Cluster, ClusterPhase, Worker};
use nodepool_id::ObjectKey;
use nodepool_reconcile::{BackoffPolicy, ControllerHandle, ControllerOptions, ReconcileContext};
use nodepool_testing::{cluster, DEFAULT_TYPE};
use nodepool_worker_controller::{add, Actuator, ActuatorError, AddArgs, InMemoryApi};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NAMESPACE: &str = "shoot--a";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

/// Actuator that records calls and fails on demand.
#[derive(Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<(Call, ObjectKey)>>,
    failures: Mutex<HashMap<Call, VecDeque<ActuatorError>>>,
}

impl RecordingActuator {
    /// Makes the next `times` calls of `call` fail with `err`.
    pub fn fail(&self, call: Call, err: ActuatorError, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .entry(call)
            .or_default()
            .extend(std::iter::repeat(err).take(times));
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == call)
            .count()
    }

    pub fn count_for(&self, call: Call, key: &ObjectKey) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, k)| *c == call && k == key)
            .count()
    }

    fn record(&self, call: Call, worker: &Worker) -> Result<(), ActuatorError> {
        self.calls
            .lock()
            .unwrap()
            .push((call, worker.metadata.key()));
        match self.failures.lock().unwrap().get_mut(&call) {
            Some(queue) => queue.pop_front().map_or(Ok(()), Err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn reconcile(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError> {
        self.record(Call::Reconcile, worker)?;
        Ok(Some(serde_json::json!({ "pools": worker.spec.pools.len() })))
    }

    async fn delete(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError> {
        self.record(Call::Delete, worker)
    }

    async fn migrate(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError> {
        self.record(Call::Migrate, worker)
    }

    async fn restore(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError> {
        self.record(Call::Restore, worker)?;
        Ok(None)
    }
}

pub fn options() -> ControllerOptions {
    ControllerOptions {
        max_concurrent_reconciles: 2,
        backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8)),
        drain_timeout: Duration::from_secs(5),
    }
}

/// Both controllers running against an in-memory API with a healthy
/// cluster for [`NAMESPACE`].
pub struct Harness {
    pub api: InMemoryApi,
    pub actuator: Arc<RecordingActuator>,
    pub worker_handle: ControllerHandle,
    pub state_handle: ControllerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(ignore_operation_annotation: bool) -> Self {
        Self::start_with_cluster(ignore_operation_annotation, ClusterPhase::Healthy)
    }

    pub fn start_with_cluster(ignore_operation_annotation: bool, phase: ClusterPhase) -> Self {
        let api = InMemoryApi::new();
        api.clusters.create(cluster(NAMESPACE, phase)).unwrap();

        let actuator = Arc::new(RecordingActuator::default());
        let controllers = add(AddArgs {
            actuator: actuator.clone(),
            api: Arc::new(api.clone()),
            informers: api.informers(),
            options: options(),
            ignore_operation_annotation,
            extension_type: DEFAULT_TYPE.to_string(),
        });
        let (worker_handle, state_handle) = controllers.handles();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controllers.run(shutdown_rx));

        Self {
            api,
            actuator,
            worker_handle,
            state_handle,
            shutdown,
            task,
        }
    }

    /// Lets every pending event and reconcile run to completion.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub fn worker(&self, key: &ObjectKey) -> Option<Worker> {
        self.api.workers.get(key)
    }

    pub fn create(&self, worker: Worker) -> Worker {
        self.api.workers.create(worker).unwrap()
    }

    pub fn set_cluster_phase(&self, phase: ClusterPhase) {
        self.api
            .clusters
            .modify(&ObjectKey::new("", NAMESPACE), |c| c.status.phase = phase)
            .unwrap();
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap();
    }
}
