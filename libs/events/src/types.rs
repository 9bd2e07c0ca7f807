//! Resource kinds watched by the node pool controllers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::meta::{ObjectMeta, OwnerReference, Resource};

// =============================================================================
// Operations
// =============================================================================

/// Values of the operation annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Reconcile,
    Migrate,
    Restore,
}

impl FromStr for Operation {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile" => Ok(Operation::Reconcile),
            "migrate" => Ok(Operation::Migrate),
            "restore" => Ok(Operation::Restore),
            other => Err(EventError::UnknownOperation(other.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Reconcile => "reconcile",
            Operation::Migrate => "migrate",
            Operation::Restore => "restore",
        };
        write!(f, "{}", s)
    }
}

/// Type of the last operation performed on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

/// Outcome of the last operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    /// Failed, will be retried automatically.
    Error,
    /// Failed, needs an explicit trigger to retry.
    Failed,
}

/// The last operation recorded on a worker's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub kind: LastOperationType,
    pub state: LastOperationState,
    pub description: String,
    pub last_update_time: DateTime<Utc>,
}

impl LastOperation {
    pub fn new(
        kind: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            state,
            description: description.into(),
            last_update_time: Utc::now(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.state == LastOperationState::Succeeded
    }
}

/// The last error recorded on a worker's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    /// Whether the controller will retry without an external trigger.
    pub retryable: bool,
    pub last_update_time: DateTime<Utc>,
}

// =============================================================================
// Worker
// =============================================================================

/// A node pool managed on behalf of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub metadata: ObjectMeta,
    pub spec: WorkerSpec,
    #[serde(default)]
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Backend discriminator; one controller handles one type.
    #[serde(rename = "type")]
    pub kind: String,
    pub region: String,
    #[serde(default)]
    pub pools: Vec<WorkerPool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub name: String,
    pub machine_type: String,
    pub minimum: u32,
    pub maximum: u32,
    #[serde(default)]
    pub zones: Vec<String>,
}

/// Lifecycle phase of a worker as seen by the provisioning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Pending,
    Reconciling,
    Ready,
    Deleting,
    Failed,
}

/// Worker status.
///
/// The provisioning loop owns every field except `state`, which belongs to
/// the state loop. Writers must never touch the other loop's fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkerPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<WorkerState>,
}

impl Worker {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: WorkerSpec {
                kind: kind.into(),
                region: String::new(),
                pools: Vec::new(),
                provider_config: None,
            },
            status: WorkerStatus::default(),
        }
    }

    /// The parsed operation annotation; unknown values count as `reconcile`.
    pub fn operation(&self) -> Option<Operation> {
        self.metadata
            .operation_annotation()
            .map(|v| v.parse().unwrap_or(Operation::Reconcile))
    }

    /// True when the worker was migrated away and not restored since.
    pub fn is_migrated(&self) -> bool {
        self.status.last_operation.as_ref().is_some_and(|op| {
            op.kind == LastOperationType::Migrate && op.state == LastOperationState::Succeeded
        })
    }
}

impl Resource for Worker {
    const KIND: &'static str = "Worker";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn extension_type(&self) -> Option<&str> {
        Some(&self.spec.kind)
    }

    fn last_operation(&self) -> Option<&LastOperation> {
        self.status.last_operation.as_ref()
    }
}

// =============================================================================
// Aggregated state
// =============================================================================

/// Snapshot of all dependents of a worker, written by the state loop.
///
/// Built from sorted maps so the same set of observations always yields the
/// same snapshot, whatever order they arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    #[serde(default)]
    pub machine_sets: BTreeMap<String, MachineSetState>,
    #[serde(default)]
    pub phase_counts: BTreeMap<MachinePhase, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub replicas: u32,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub phase: MachinePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl WorkerState {
    pub fn machine_count(&self) -> u32 {
        self.phase_counts.values().sum()
    }

    /// Human readable phase counts, e.g. `2 Ready, 1 Provisioning`.
    pub fn summary(&self) -> String {
        if self.phase_counts.is_empty() {
            return "no machines".to_string();
        }

        self.phase_counts
            .iter()
            .map(|(phase, count)| format!("{} {}", count, phase))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// =============================================================================
// Machines
// =============================================================================

/// Phase of a single machine.
///
/// Declaration order is the display order of [`WorkerState::summary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MachinePhase {
    Ready,
    Provisioning,
    #[default]
    Pending,
    Terminating,
    Failed,
    Unknown,
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachinePhase::Ready => "Ready",
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Pending => "Pending",
            MachinePhase::Terminating => "Terminating",
            MachinePhase::Failed => "Failed",
            MachinePhase::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MachinePhase {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ready" => Ok(MachinePhase::Ready),
            "Provisioning" => Ok(MachinePhase::Provisioning),
            "Pending" => Ok(MachinePhase::Pending),
            "Terminating" => Ok(MachinePhase::Terminating),
            "Failed" => Ok(MachinePhase::Failed),
            "Unknown" => Ok(MachinePhase::Unknown),
            other => Err(EventError::UnknownPhase(other.to_string())),
        }
    }
}

/// A node-pool group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSet {
    pub metadata: ObjectMeta,
    pub spec: MachineSetSpec,
    #[serde(default)]
    pub status: MachineSetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSetSpec {
    pub pool: String,
    pub replicas: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    #[serde(default)]
    pub ready_replicas: u32,
}

impl MachineSet {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        pool: impl Into<String>,
        replicas: u32,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: MachineSetSpec {
                pool: pool.into(),
                replicas,
            },
            status: MachineSetStatus::default(),
        }
    }

    pub fn owned_by(mut self, owner: &Worker) -> Self {
        self.metadata.owner_references.push(OwnerReference::controller_of(owner));
        self
    }
}

impl Resource for MachineSet {
    const KIND: &'static str = "MachineSet";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A node-pool member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the machine set this machine was created for.
    pub machine_set: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub phase: MachinePhase,
    /// Name of the node this machine is bound to. Serialized as `null` when
    /// unbound so field comparisons stay evaluable.
    pub node: Option<String>,
}

impl Machine {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        machine_set: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: MachineSpec {
                machine_set: machine_set.into(),
                provider_id: None,
            },
            status: MachineStatus::default(),
        }
    }

    pub fn owned_by(mut self, owner: &Worker) -> Self {
        self.metadata.owner_references.push(OwnerReference::controller_of(owner));
        self
    }
}

impl Resource for Machine {
    const KIND: &'static str = "Machine";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Health of a tenant cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    #[default]
    Healthy,
    Maintenance,
    /// The last cluster operation failed; reconciliation must not proceed.
    Failed,
}

/// Per-tenant context. Its name equals the namespace of the tenant's objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
}

impl Cluster {
    /// Cluster objects are not namespaced; the key namespace is empty.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new("", name),
            status: ClusterStatus::default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status.phase == ClusterPhase::Failed
    }
}

impl Resource for Cluster {
    const KIND: &'static str = "Cluster";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
