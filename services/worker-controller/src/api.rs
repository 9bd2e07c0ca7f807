//! Write side of the worker API and the read side used to feed controllers.
//!
//! Controllers never write objects wholesale. Each writer goes through a
//! narrow call that touches only the fields it owns, so the provisioning
//! loop and the state loop cannot clobber each other.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use nodepool_events::{LastError, LastOperation, Resource, WatchEvent, WorkerPhase, WorkerState};
use nodepool_id::ObjectKey;
use nodepool_reconcile::{ReconcileError, Store};
use serde_json::Value;
use thiserror::Error;

/// API errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The API could not be reached or refused the request for now.
    #[error("api unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<ApiError> for ReconcileError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::AlreadyExists { .. } => ReconcileError::terminal(e),
            ApiError::NotFound { .. } | ApiError::Unavailable(_) => ReconcileError::retryable(e),
        }
    }
}

/// Status fields owned by the provisioning loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub phase: WorkerPhase,
    pub last_operation: LastOperation,

    /// Replaces the recorded error; `None` clears it.
    pub last_error: Option<LastError>,

    /// Left unchanged when `None`.
    pub observed_generation: Option<i64>,

    /// Left unchanged when `None`.
    pub provider_status: Option<Value>,
}

/// Writes the controllers make to workers.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Writes the provisioning loop's status fields. Never touches
    /// `status.state`.
    async fn update_operation_status(
        &self,
        key: &ObjectKey,
        status: OperationStatus,
    ) -> Result<(), ApiError>;

    /// Writes `status.state` and nothing else.
    async fn update_state(&self, key: &ObjectKey, state: WorkerState) -> Result<(), ApiError>;

    /// Adds `finalizer` if missing.
    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), ApiError>;

    /// Removes `finalizer` if present. A deleting worker without finalizers
    /// is removed.
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), ApiError>;

    /// Clears the operation annotation if set.
    async fn remove_operation_annotation(&self, key: &ObjectKey) -> Result<(), ApiError>;
}

/// Cache plus change feed for one resource kind.
///
/// The cache is updated before each event is delivered. Every call to
/// [`Informer::watch`] yields an independent stream that starts with a
/// `Created` event per cached object.
pub trait Informer<K: Resource>: Send + Sync {
    fn store(&self) -> Store<K>;

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>>;
}
