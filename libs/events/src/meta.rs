//! Object metadata shared by every resource kind.

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use nodepool_id::{ObjectKey, ObjectUid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::LastOperation;

/// Annotation an external operator sets to request a reconcile.
pub const OPERATION_ANNOTATION: &str = "nodepool.dev/operation";

/// Weak back reference from a dependent object to its owner.
///
/// Only the owner's identity is stored; the owner itself is resolved through
/// the watch cache whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner (e.g. `Worker`).
    pub kind: String,

    /// Name of the owner, in the dependent's namespace.
    pub name: String,

    /// Uid of the owner incarnation this reference was written for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<ObjectUid>,

    /// Whether the owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Builds a controller reference to `owner`.
    pub fn controller_of<R: Resource>(owner: &R) -> Self {
        Self {
            kind: R::KIND.to_string(),
            name: owner.meta().name.clone(),
            uid: Some(owner.meta().uid),
            controller: true,
        }
    }
}

/// Standard object metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: ObjectUid,

    /// Incremented by the store whenever the spec changes.
    #[serde(default)]
    pub generation: i64,

    /// Incremented by the store on every write.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Creates metadata for a new object with a fresh uid.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: ObjectUid::new(),
            generation: 1,
            resource_version: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            owner_references: Vec::new(),
            creation_timestamp: None,
            deletion_timestamp: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Value of the operation annotation, if set.
    pub fn operation_annotation(&self) -> Option<&str> {
        self.annotations.get(OPERATION_ANNOTATION).map(String::as_str)
    }

    /// Owner references of the given kind.
    pub fn owners_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a OwnerReference> {
        self.owner_references.iter().filter(move |r| r.kind == kind)
    }
}

/// Common behavior of every watched resource kind.
pub trait Resource:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name used in owner references and logs.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    /// The backend type discriminator, for kinds that carry one.
    fn extension_type(&self) -> Option<&str> {
        None
    }

    /// The last recorded operation, for kinds that track one.
    fn last_operation(&self) -> Option<&LastOperation> {
        None
    }
}
