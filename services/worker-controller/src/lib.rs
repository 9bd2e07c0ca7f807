//! nodepool Worker Controller Library
//!
//! Reconciles `Worker` node pools against a backend [`actuator::Actuator`]
//! and reports the aggregated state of their machines.
//!
//! ## Architecture
//!
//! ```text
//! Informers (cache + watch)
//! ├── worker        (provisioning: finalizer, actuator, operation status)
//! └── worker-state  (aggregates MachineSets/Machines into status.state)
//! ```
//!
//! Both controllers are built by [`controller::add`] and share the same
//! actuator, API and concurrency settings, but nothing else.
//!
//! ## Modules
//!
//! - `actuator`: backend interface and a no-op implementation
//! - `api`: status write boundary and watch sources
//! - `memory`: in-memory API for development and tests
//! - `mapping`: dependent-to-worker event routing

pub mod actuator;
pub mod api;
pub mod config;
pub mod controller;
pub mod mapping;
pub mod memory;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use actuator::{Actuator, ActuatorError, NoopActuator};
pub use api::{ApiError, Informer, OperationStatus, WorkerApi};
pub use controller::{
    add, AddArgs, Informers, WorkerControllers, CONTROLLER_NAME, CONTROLLER_NAME_STATE,
    FINALIZER_NAME,
};
pub use memory::{InMemoryApi, Tracker};
