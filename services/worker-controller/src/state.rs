//! State loop: aggregates a worker's machine sets and machines into
//! `status.state`.
//!
//! Runs as its own controller so slow provisioning never delays state
//! reporting. It only reads dependents and only writes `status.state`.

use std::sync::Arc;

use async_trait::async_trait;
use nodepool_events::{Machine, MachineSet, MachineState, Resource, Worker, WorkerState};
use nodepool_id::ObjectKey;
use nodepool_reconcile::{Action, ReconcileContext, ReconcileError, Reconciler, Store};
use tracing::{debug, info};

use crate::api::WorkerApi;

pub struct StateReconciler {
    api: Arc<dyn WorkerApi>,
    workers: Store<Worker>,
    machine_sets: Store<MachineSet>,
    machines: Store<Machine>,
}

impl StateReconciler {
    pub fn new(
        api: Arc<dyn WorkerApi>,
        workers: Store<Worker>,
        machine_sets: Store<MachineSet>,
        machines: Store<Machine>,
    ) -> Self {
        Self {
            api,
            workers,
            machine_sets,
            machines,
        }
    }
}

#[async_trait]
impl Reconciler for StateReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let Some(worker) = self.workers.get(key) else {
            debug!("Worker no longer exists");
            return Ok(Action::Done);
        };

        let sets = owned_by(&worker, self.machine_sets.list_owned_by(Worker::KIND, key));
        let machines = owned_by(&worker, self.machines.list_owned_by(Worker::KIND, key));
        let state = aggregate_state(&sets, &machines);

        if worker.status.state.as_ref() == Some(&state) {
            debug!("State unchanged");
            return Ok(Action::Done);
        }

        self.api.update_state(key, state.clone()).await?;
        info!(
            machines = state.machine_count(),
            summary = %state.summary(),
            "Worker state updated"
        );
        Ok(Action::Done)
    }
}

/// Drops dependents whose owner reference points at an earlier incarnation
/// of `worker`.
fn owned_by<K: Resource>(worker: &Worker, objects: Vec<Arc<K>>) -> Vec<Arc<K>> {
    objects
        .into_iter()
        .filter(|obj| {
            obj.meta().owners_of_kind(Worker::KIND).any(|r| {
                r.name == worker.metadata.name
                    && r.uid.is_none_or(|uid| uid == worker.metadata.uid)
            })
        })
        .collect()
}

/// Builds the state snapshot for one worker.
///
/// The result depends only on the set of inputs, not their order. Machines
/// whose machine set is unknown still appear, under their set's name.
pub fn aggregate_state(sets: &[Arc<MachineSet>], machines: &[Arc<Machine>]) -> WorkerState {
    let mut state = WorkerState::default();

    for set in sets {
        let entry = state
            .machine_sets
            .entry(set.metadata.name.clone())
            .or_default();
        entry.pool = Some(set.spec.pool.clone());
        entry.replicas = set.spec.replicas;
    }

    for machine in machines {
        state
            .machine_sets
            .entry(machine.spec.machine_set.clone())
            .or_default()
            .machines
            .insert(
                machine.metadata.name.clone(),
                MachineState {
                    phase: machine.status.phase,
                    node: machine.status.node.clone(),
                },
            );
        *state.phase_counts.entry(machine.status.phase).or_insert(0) += 1;
    }

    state
}
