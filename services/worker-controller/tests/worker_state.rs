//! End to end tests of the state loop.

mod common;

use common::{Call, Harness, NAMESPACE};
use nodepool_events::{MachinePhase, Worker};
use nodepool_id::ObjectKey;
use nodepool_testing::{machine, machine_set, WorkerBuilder};

fn populate(h: &Harness, worker: &Worker) {
    h.api
        .machine_sets
        .create(machine_set(worker, "set-a", "default", 3))
        .unwrap();
    for (name, phase, node) in [
        ("m-1", MachinePhase::Ready, Some("node-1")),
        ("m-2", MachinePhase::Provisioning, None),
        ("m-3", MachinePhase::Ready, Some("node-3")),
    ] {
        h.api
            .machines
            .create(machine(worker, "set-a", name, phase, node))
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_state_is_aggregated() {
    let h = Harness::start(false);
    let worker = h.create(WorkerBuilder::new(NAMESPACE, "w").build());
    let key = worker.metadata.key();
    populate(&h, &worker);
    h.settle().await;

    let state = h.worker(&key).unwrap().status.state.unwrap();
    assert_eq!(state.summary(), "2 Ready, 1 Provisioning");
    assert_eq!(state.machine_sets["set-a"].replicas, 3);

    // Phase changes reach the state loop.
    h.api
        .machines
        .modify(&ObjectKey::new(NAMESPACE, "m-2"), |m| {
            m.status.phase = MachinePhase::Ready;
        })
        .unwrap();
    h.settle().await;

    let state = h.worker(&key).unwrap().status.state.unwrap();
    assert_eq!(state.summary(), "3 Ready");

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_state_is_not_written() {
    let h = Harness::start(false);
    let worker = h.create(WorkerBuilder::new(NAMESPACE, "w").build());
    let key = worker.metadata.key();
    h.settle().await;
    let reconciles = h.actuator.count(Call::Reconcile);

    populate(&h, &worker);
    h.settle().await;
    let before = h.worker(&key).unwrap().metadata.resource_version;

    h.state_handle.enqueue(key.clone());
    h.settle().await;

    assert_eq!(h.worker(&key).unwrap().metadata.resource_version, before);
    assert_eq!(h.actuator.count(Call::Reconcile), reconciles);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_machines_of_other_workers_are_ignored() {
    let h = Harness::start(false);
    let worker = h.create(WorkerBuilder::new(NAMESPACE, "w").build());
    let other = h.create(WorkerBuilder::new(NAMESPACE, "other").build());
    populate(&h, &worker);
    h.api
        .machines
        .create(machine(&other, "set-b", "m-9", MachinePhase::Failed, None))
        .unwrap();
    h.settle().await;

    let state = h.worker(&worker.metadata.key()).unwrap().status.state.unwrap();
    assert_eq!(state.machine_count(), 3);

    let state = h.worker(&other.metadata.key()).unwrap().status.state.unwrap();
    assert_eq!(state.summary(), "1 Failed");

    h.stop().await;
}
