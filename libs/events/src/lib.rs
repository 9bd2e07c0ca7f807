//! # nodepool-events
//!
//! Resource model and watch event types for the node pool controllers.
//!
//! ## Resources
//!
//! - [`Worker`]: the primary resource, a logical pool of compute nodes
//! - [`MachineSet`]: a node-pool group owned by a worker
//! - [`Machine`]: a node-pool member owned by a worker
//! - [`Cluster`]: the per-tenant context whose health gates reconciliation
//!
//! Only the fields needed for mapping, predicates and status bookkeeping are
//! modeled; provider specific configuration travels as opaque JSON.
//!
//! ## Watch Events
//!
//! Every change to a resource is delivered as a [`WatchEvent`]: `Created`,
//! `Updated { old, new }`, `Deleted`, or a synthetic `Generic` event used when
//! one object's change is re-evaluated against another.

mod envelope;
mod error;
mod meta;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use meta::*;
pub use types::*;
