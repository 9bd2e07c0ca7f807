//! Provisioning loop for workers.
//!
//! Drives a worker through its lifecycle using the [`Actuator`]:
//!
//! ```text
//! (new) ──reconcile──► Reconciling ──ok──► Ready
//!                          │
//!                          └──err──► Failed ──retry──► Reconciling
//! deletion timestamp ──► Deleting ──ok──► finalizer removed (gone)
//! ```
//!
//! The operation annotation is consumed before an operation starts. Retries
//! after a retryable failure come from the queue's backoff, not from the
//! annotation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nodepool_events::{
    Cluster, LastError, LastOperation, LastOperationState, LastOperationType, Operation, Worker,
    WorkerPhase, WorkerStatus,
};
use nodepool_id::ObjectKey;
use nodepool_reconcile::{Action, ReconcileContext, ReconcileError, Reconciler, Store};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::actuator::{Actuator, ActuatorError};
use crate::api::{OperationStatus, WorkerApi};
use crate::controller::FINALIZER_NAME;

/// Reconciles workers against the actuator.
pub struct WorkerReconciler {
    actuator: Arc<dyn Actuator>,
    api: Arc<dyn WorkerApi>,
    workers: Store<Worker>,
    clusters: Store<Cluster>,
}

impl WorkerReconciler {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        api: Arc<dyn WorkerApi>,
        workers: Store<Worker>,
        clusters: Store<Cluster>,
    ) -> Self {
        Self {
            actuator,
            api,
            workers,
            clusters,
        }
    }

    #[instrument(skip_all)]
    async fn delete(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let key = worker.metadata.key();
        if !worker.metadata.has_finalizer(FINALIZER_NAME) {
            debug!("No finalizer, nothing to tear down");
            return Ok(Action::Done);
        }

        self.start(worker, LastOperationType::Delete, WorkerPhase::Deleting, "Deleting the worker")
            .await?;

        match self.actuator.delete(worker, cluster, ctx).await {
            Ok(()) => {
                self.api.remove_finalizer(&key, FINALIZER_NAME).await?;
                info!("Worker deleted");
                Ok(Action::Done)
            }
            Err(e) => self.fail(&key, LastOperationType::Delete, e).await,
        }
    }

    #[instrument(skip_all)]
    async fn migrate(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let key = worker.metadata.key();
        self.start(worker, LastOperationType::Migrate, WorkerPhase::Reconciling, "Migrating the worker")
            .await?;

        match self.actuator.migrate(worker, cluster, ctx).await {
            Ok(()) => {
                self.record(
                    &key,
                    OperationStatus {
                        phase: WorkerPhase::Pending,
                        last_operation: LastOperation::new(
                            LastOperationType::Migrate,
                            LastOperationState::Succeeded,
                            "Worker has been successfully migrated",
                        ),
                        last_error: None,
                        observed_generation: None,
                        provider_status: None,
                    },
                )
                .await?;
                // Machines now belong elsewhere; deletion must not tear them down.
                self.api.remove_finalizer(&key, FINALIZER_NAME).await?;
                info!("Worker migrated");
                Ok(Action::Done)
            }
            Err(e) => self.fail(&key, LastOperationType::Migrate, e).await,
        }
    }

    #[instrument(skip_all)]
    async fn restore(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        self.ensure_finalizer(worker).await?;
        self.start(worker, LastOperationType::Restore, WorkerPhase::Reconciling, "Restoring the worker")
            .await?;

        let result = self.actuator.restore(worker, cluster, ctx).await;
        self.finish(worker, LastOperationType::Restore, result).await
    }

    async fn reconcile_worker(
        &self,
        worker: &Worker,
        cluster: &Cluster,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let kind = match worker.status.last_operation.as_ref() {
            None => LastOperationType::Create,
            Some(op) if op.kind == LastOperationType::Create && !op.is_succeeded() => {
                LastOperationType::Create
            }
            Some(_) => LastOperationType::Reconcile,
        };

        self.ensure_finalizer(worker).await?;
        self.start(worker, kind, WorkerPhase::Reconciling, "Reconciling the worker")
            .await?;

        let result = self.actuator.reconcile(worker, cluster, ctx).await;
        self.finish(worker, kind, result).await
    }

    async fn ensure_finalizer(&self, worker: &Worker) -> Result<(), ReconcileError> {
        if !worker.metadata.has_finalizer(FINALIZER_NAME) {
            self.api
                .add_finalizer(&worker.metadata.key(), FINALIZER_NAME)
                .await?;
        }
        Ok(())
    }

    /// Records the operation as processing. A retry of the same operation
    /// keeps its recorded status.
    async fn start(
        &self,
        worker: &Worker,
        kind: LastOperationType,
        phase: WorkerPhase,
        description: &str,
    ) -> Result<(), ReconcileError> {
        if is_retry_of(&worker.status, kind) {
            return Ok(());
        }

        self.record(
            &worker.metadata.key(),
            OperationStatus {
                phase,
                last_operation: LastOperation::new(kind, LastOperationState::Processing, description),
                last_error: worker.status.last_error.clone(),
                observed_generation: None,
                provider_status: None,
            },
        )
        .await
    }

    async fn finish(
        &self,
        worker: &Worker,
        kind: LastOperationType,
        result: Result<Option<Value>, ActuatorError>,
    ) -> Result<Action, ReconcileError> {
        let key = worker.metadata.key();
        match result {
            Ok(provider_status) => {
                self.record(
                    &key,
                    OperationStatus {
                        phase: WorkerPhase::Ready,
                        last_operation: LastOperation::new(
                            kind,
                            LastOperationState::Succeeded,
                            success_message(kind),
                        ),
                        last_error: None,
                        observed_generation: Some(worker.metadata.generation),
                        provider_status,
                    },
                )
                .await?;
                info!(operation = ?kind, "Worker reconciled");
                Ok(Action::Done)
            }
            Err(e) => self.fail(&key, kind, e).await,
        }
    }

    async fn fail(
        &self,
        key: &ObjectKey,
        kind: LastOperationType,
        err: ActuatorError,
    ) -> Result<Action, ReconcileError> {
        let retryable = err.is_retryable();
        let state = if retryable {
            LastOperationState::Error
        } else {
            LastOperationState::Failed
        };

        self.record(
            key,
            OperationStatus {
                phase: WorkerPhase::Failed,
                last_operation: LastOperation::new(kind, state, err.to_string()),
                last_error: Some(LastError {
                    description: err.to_string(),
                    retryable,
                    last_update_time: Utc::now(),
                }),
                observed_generation: None,
                provider_status: None,
            },
        )
        .await?;

        Err(if retryable {
            ReconcileError::retryable(err)
        } else {
            ReconcileError::terminal(err)
        })
    }

    /// Writes `status` unless the cached worker already shows it.
    async fn record(&self, key: &ObjectKey, status: OperationStatus) -> Result<(), ReconcileError> {
        if let Some(current) = self.workers.get(key) {
            if !status_differs(&current.status, &status) {
                return Ok(());
            }
        }
        self.api.update_operation_status(key, status).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for WorkerReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let Some(worker) = self.workers.get(key) else {
            debug!("Worker no longer exists");
            return Ok(Action::Done);
        };

        let cluster_key = ObjectKey::new("", &key.namespace);
        let Some(cluster) = self.clusters.get(&cluster_key) else {
            return Err(ReconcileError::retryable(format!(
                "cluster {} not found",
                key.namespace
            )));
        };

        if cluster.is_failed() {
            info!(cluster = %cluster.metadata.name, "Cluster is failed, skipping");
            return Ok(Action::Done);
        }

        // Consumed before any other write so that those writes do not pass
        // the annotation gate again.
        if worker.metadata.operation_annotation().is_some() {
            self.api.remove_operation_annotation(key).await?;
        }

        if worker.metadata.is_deleting() {
            return self.delete(&worker, &cluster, ctx).await;
        }

        match worker.operation() {
            Some(Operation::Migrate) => self.migrate(&worker, &cluster, ctx).await,
            Some(Operation::Restore) => self.restore(&worker, &cluster, ctx).await,
            _ if worker.is_migrated() => {
                debug!("Worker was migrated, waiting for restore");
                Ok(Action::Done)
            }
            _ => self.reconcile_worker(&worker, &cluster, ctx).await,
        }
    }
}

fn success_message(kind: LastOperationType) -> &'static str {
    match kind {
        LastOperationType::Restore => "Worker has been successfully restored",
        _ => "Worker has been successfully reconciled",
    }
}

fn is_retry_of(status: &WorkerStatus, kind: LastOperationType) -> bool {
    status.last_operation.as_ref().is_some_and(|op| {
        op.kind == kind
            && matches!(
                op.state,
                LastOperationState::Processing | LastOperationState::Error
            )
    })
}

/// True when writing `next` would change anything besides timestamps.
fn status_differs(current: &WorkerStatus, next: &OperationStatus) -> bool {
    let same_operation = current.last_operation.as_ref().is_some_and(|op| {
        op.kind == next.last_operation.kind
            && op.state == next.last_operation.state
            && op.description == next.last_operation.description
    });

    let same_error = match (&current.last_error, &next.last_error) {
        (None, None) => true,
        (Some(a), Some(b)) => a.description == b.description && a.retryable == b.retryable,
        _ => false,
    };

    current.phase != Some(next.phase)
        || !same_operation
        || !same_error
        || next
            .observed_generation
            .is_some_and(|g| g != current.observed_generation)
        || next
            .provider_status
            .as_ref()
            .is_some_and(|s| current.provider_status.as_ref() != Some(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(kind: LastOperationType, state: LastOperationState) -> WorkerStatus {
        WorkerStatus {
            phase: Some(WorkerPhase::Failed),
            last_operation: Some(LastOperation::new(kind, state, "backend unavailable")),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_retry_of() {
        let failed = status(LastOperationType::Reconcile, LastOperationState::Error);
        assert!(is_retry_of(&failed, LastOperationType::Reconcile));
        assert!(!is_retry_of(&failed, LastOperationType::Delete));

        let done = status(LastOperationType::Reconcile, LastOperationState::Succeeded);
        assert!(!is_retry_of(&done, LastOperationType::Reconcile));
        assert!(!is_retry_of(&WorkerStatus::default(), LastOperationType::Create));
    }

    #[test]
    fn test_status_differs_ignores_timestamps() {
        let current = status(LastOperationType::Reconcile, LastOperationState::Error);
        let mut next = OperationStatus {
            phase: WorkerPhase::Failed,
            last_operation: LastOperation::new(
                LastOperationType::Reconcile,
                LastOperationState::Error,
                "backend unavailable",
            ),
            last_error: None,
            observed_generation: None,
            provider_status: None,
        };
        assert!(!status_differs(&current, &next));

        next.provider_status = Some(serde_json::json!({"machines": 3}));
        assert!(status_differs(&current, &next));

        next.provider_status = None;
        next.phase = WorkerPhase::Ready;
        assert!(status_differs(&current, &next));
    }
}
