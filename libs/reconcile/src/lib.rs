//! Event dispatch and reconcile loop primitives.
//!
//! This library turns raw watch events into reconcile requests and drives
//! reconcile loops over them:
//!
//! ```text
//! watch event -> Predicate (keep/drop) -> EventHandler (0..n keys)
//!             -> WorkQueue (dedup, backoff) -> Reconciler
//! ```
//!
//! # Invariants
//!
//! - A key is processed by at most one worker of a controller at a time
//! - Events for a key that is queued or in flight coalesce into one entry
//! - Predicates and mappers only read the watch cache, they never block
//! - One key's failure never blocks processing of other keys

pub mod backoff;
pub mod controller;
pub mod error;
pub mod mapper;
pub mod predicate;
pub mod queue;
pub mod store;

pub use backoff::{BackoffPolicy, ItemBackoff};
pub use controller::{
    Action, Controller, ControllerHandle, ControllerOptions, Dispatcher, ReconcileContext,
    Reconciler,
};
pub use error::{MappingError, ReconcileError};
pub use mapper::{EventHandler, MapMode, Mapper, OwnerMapper, TenantMapper};
pub use predicate::Predicate;
pub use queue::WorkQueue;
pub use store::Store;
