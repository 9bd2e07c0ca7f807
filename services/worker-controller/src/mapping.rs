//! Event handlers and predicates that route dependent objects to workers.

use nodepool_events::{Cluster, Machine, MachineSet, Worker};
use nodepool_reconcile::{EventHandler, MapMode, OwnerMapper, Predicate, Store, TenantMapper};

/// Maps a cluster to every worker of its tenant that passes `predicate`.
pub fn cluster_to_worker(workers: Store<Worker>, predicate: Predicate) -> EventHandler<Cluster> {
    EventHandler::mapped(TenantMapper::new(workers, predicate), MapMode::UpdateWithNew)
}

/// Maps a machine set to its owning worker if the worker passes `predicate`.
pub fn machine_set_to_worker(
    workers: Store<Worker>,
    predicate: Predicate,
) -> EventHandler<MachineSet> {
    EventHandler::mapped(OwnerMapper::new(workers, predicate), MapMode::UpdateWithNew)
}

/// Maps a machine to its owning worker if the worker passes `predicate`.
pub fn machine_to_worker(workers: Store<Worker>, predicate: Predicate) -> EventHandler<Machine> {
    EventHandler::mapped(OwnerMapper::new(workers, predicate), MapMode::UpdateWithNew)
}

/// Cluster changes worth re-evaluating workers for.
pub fn cluster_predicates() -> Predicate {
    Predicate::field_changed("/status/phase")
}

/// Machine set changes the state loop reacts to.
pub fn machine_set_predicates() -> Predicate {
    Predicate::GenerationChanged
}

/// Machine changes the state loop reacts to: node binding, phase or spec.
pub fn machine_state_predicates() -> Predicate {
    Predicate::any([
        Predicate::field_changed("/status/node"),
        Predicate::field_changed("/status/phase"),
        Predicate::GenerationChanged,
    ])
}
