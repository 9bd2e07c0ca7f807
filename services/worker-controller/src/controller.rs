//! Wiring of the worker controllers.
//!
//! Two controllers share one actuator and API:
//!
//! ```text
//! worker        <- Worker, Cluster (annotation gate only)
//! worker-state  <- MachineSet, Machine
//! ```
//!
//! Each has its own queue and worker pool, so a slow provisioning run never
//! holds up state reporting for the same worker. Dependent churn only ever
//! reaches the state loop.

use std::sync::Arc;

use nodepool_events::{Cluster, Machine, MachineSet, Worker};
use nodepool_reconcile::predicate::{add_type_predicate, default_controller_predicates};
use nodepool_reconcile::{Controller, ControllerHandle, ControllerOptions, EventHandler, Predicate};
use tokio::sync::watch;
use tracing::info;

use crate::actuator::Actuator;
use crate::api::{Informer, WorkerApi};
use crate::mapping;
use crate::reconciler::WorkerReconciler;
use crate::state::StateReconciler;

/// Name of the provisioning controller.
pub const CONTROLLER_NAME: &str = "worker";

/// Name of the state controller.
pub const CONTROLLER_NAME_STATE: &str = "worker-state";

/// Finalizer the provisioning controller puts on workers.
pub const FINALIZER_NAME: &str = "nodepool.dev/worker";

/// Watch sources for every kind the controllers need.
#[derive(Clone)]
pub struct Informers {
    pub workers: Arc<dyn Informer<Worker>>,
    pub clusters: Arc<dyn Informer<Cluster>>,
    pub machine_sets: Arc<dyn Informer<MachineSet>>,
    pub machines: Arc<dyn Informer<Machine>>,
}

/// Arguments for [`add`].
pub struct AddArgs {
    pub actuator: Arc<dyn Actuator>,
    pub api: Arc<dyn WorkerApi>,
    pub informers: Informers,

    /// Queue and worker pool settings, shared by both controllers.
    pub options: ControllerOptions,

    /// Reconcile on spec changes instead of the operation annotation.
    pub ignore_operation_annotation: bool,

    /// Only workers of this type are handled.
    pub extension_type: String,
}

/// The two controllers, ready to run.
pub struct WorkerControllers {
    pub worker: Controller<WorkerReconciler>,
    pub state: Controller<StateReconciler>,
}

impl WorkerControllers {
    /// Handles for enqueueing keys manually: (provisioning, state).
    pub fn handles(&self) -> (ControllerHandle, ControllerHandle) {
        (self.worker.handle(), self.state.handle())
    }

    /// Runs both controllers until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tokio::join!(self.worker.run(shutdown.clone()), self.state.run(shutdown));
    }
}

/// Builds the provisioning and state controllers and registers their
/// watches.
pub fn add(args: AddArgs) -> WorkerControllers {
    let AddArgs {
        actuator,
        api,
        informers,
        options,
        ignore_operation_annotation,
        extension_type,
    } = args;

    let workers = informers.workers.store();
    let clusters = informers.clusters.store();

    let worker_predicates = add_type_predicate(
        default_controller_predicates(ignore_operation_annotation, clusters.clone()),
        &extension_type,
    );
    let type_only = Predicate::has_type(&extension_type);

    let mut worker = Controller::new(
        CONTROLLER_NAME,
        Arc::new(WorkerReconciler::new(
            actuator,
            Arc::clone(&api),
            workers.clone(),
            clusters,
        )),
        options.clone(),
    );

    worker.watch(
        informers.workers.watch(),
        worker_predicates.clone(),
        EventHandler::ForObject,
    );

    // Clusters leaving a failed or maintenance phase unblock workers that
    // wait for the annotation.
    if !ignore_operation_annotation {
        worker.watch(
            informers.clusters.watch(),
            mapping::cluster_predicates(),
            mapping::cluster_to_worker(workers.clone(), worker_predicates),
        );
    }

    let mut state = Controller::new(
        CONTROLLER_NAME_STATE,
        Arc::new(StateReconciler::new(
            api,
            workers.clone(),
            informers.machine_sets.store(),
            informers.machines.store(),
        )),
        options,
    );

    state.watch(
        informers.machine_sets.watch(),
        mapping::machine_set_predicates(),
        mapping::machine_set_to_worker(workers.clone(), type_only.clone()),
    );
    state.watch(
        informers.machines.watch(),
        mapping::machine_state_predicates(),
        mapping::machine_to_worker(workers, type_only),
    );

    info!(
        extension_type = %extension_type,
        ignore_operation_annotation,
        watches = worker.watch_count() + state.watch_count(),
        "Worker controllers added"
    );

    WorkerControllers { worker, state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::NoopActuator;
    use crate::memory::InMemoryApi;

    fn args(api: &InMemoryApi, ignore_operation_annotation: bool) -> AddArgs {
        AddArgs {
            actuator: Arc::new(NoopActuator::new()),
            api: Arc::new(api.clone()),
            informers: api.informers(),
            options: ControllerOptions::default(),
            ignore_operation_annotation,
            extension_type: "local".to_string(),
        }
    }

    #[test]
    fn test_cluster_watch_only_with_annotation_gate() {
        let api = InMemoryApi::new();

        let gated = add(args(&api, false));
        assert_eq!(gated.worker.name(), CONTROLLER_NAME);
        assert_eq!(gated.worker.watch_count(), 2);
        assert_eq!(gated.state.name(), CONTROLLER_NAME_STATE);
        assert_eq!(gated.state.watch_count(), 2);

        let ungated = add(args(&api, true));
        assert_eq!(ungated.worker.watch_count(), 1);
        assert_eq!(ungated.state.watch_count(), 2);
    }
}
