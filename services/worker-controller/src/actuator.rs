//! Actuator interface and no-op implementation.
//!
//! The actuator is the backend specific part of a worker controller: it
//! turns a worker's spec into machines on some infrastructure. The
//! controller owns everything else (finalizers, status, retries).
//!
//! A no-op implementation is provided for development.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nodepool_events::{Cluster, Worker};
use nodepool_reconcile::ReconcileContext;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Actuator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActuatorError {
    /// The backend may succeed on a later attempt.
    #[error("retryable actuator error: {0}")]
    Retryable(String),

    /// Retrying with the same spec will not help.
    #[error("terminal actuator error: {0}")]
    Terminal(String),
}

impl ActuatorError {
    pub fn retryable(msg: impl std::fmt::Display) -> Self {
        Self::Retryable(msg.to_string())
    }

    pub fn terminal(msg: impl std::fmt::Display) -> Self {
        Self::Terminal(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Backend operations for a worker.
///
/// Every call must be idempotent. Long running calls should watch
/// `ctx` and return early once the controller shuts down.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Create or update the worker's machines. Returns the provider status
    /// to store on the worker, if any.
    async fn reconcile(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError>;

    /// Tear down everything the worker created.
    async fn delete(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError>;

    /// Release the worker's machines to another controller instance without
    /// deleting them.
    async fn migrate(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError>;

    /// Take over machines released by a migration.
    async fn restore(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError>;
}

/// Actuator that only logs. Reports a generation counter as provider status.
#[derive(Debug, Default)]
pub struct NoopActuator {
    reconciles: AtomicU64,
}

impl NoopActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful reconcile and restore calls.
    pub fn reconcile_count(&self) -> u64 {
        self.reconciles.load(Ordering::SeqCst)
    }

    fn provider_status(&self, worker: &Worker) -> Value {
        let count = self.reconciles.fetch_add(1, Ordering::SeqCst) + 1;
        serde_json::json!({
            "reconciles": count,
            "pools": worker.spec.pools.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl Actuator for NoopActuator {
    async fn reconcile(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError> {
        info!(
            worker = %worker.metadata.key(),
            cluster = %cluster.metadata.name,
            pools = worker.spec.pools.len(),
            "[NOOP] Reconciling worker"
        );
        Ok(Some(self.provider_status(worker)))
    }

    async fn delete(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError> {
        info!(worker = %worker.metadata.key(), "[NOOP] Deleting worker");
        Ok(())
    }

    async fn migrate(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<(), ActuatorError> {
        info!(worker = %worker.metadata.key(), "[NOOP] Migrating worker");
        Ok(())
    }

    async fn restore(
        &self,
        worker: &Worker,
        _cluster: &Cluster,
        _ctx: &ReconcileContext,
    ) -> Result<Option<Value>, ActuatorError> {
        debug!(worker = %worker.metadata.key(), "[NOOP] Restoring worker");
        Ok(Some(self.provider_status(worker)))
    }
}
