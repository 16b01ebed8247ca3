//! Store seam: the remote object store (or its cache) as seen by the controller.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use crate::ObjectKind;

/// Outcome classes of a remote store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },
    #[error("{kind} {name} not found")]
    NotFound { kind: ObjectKind, name: String },
    /// The write carried a stale resourceVersion.
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict { kind: ObjectKind, name: String, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("{kind} {name}: {message}")]
    Transient { kind: ObjectKind, name: String, message: String },
}

impl StoreError {
    pub fn transient(kind: ObjectKind, name: &str, message: impl Into<String>) -> Self {
        StoreError::Transient { kind, name: name.to_string(), message: message.into() }
    }

    pub fn conflict(kind: ObjectKind, name: &str) -> Self {
        StoreError::Conflict { kind, name: name.to_string(), message: "the object has been modified".into() }
    }

    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
    pub fn is_cancelled(&self) -> bool { matches!(self, StoreError::Cancelled) }
}

/// Reads and writes of replicas and claims. `get_*` return `Ok(None)` for absent
/// objects; writes report absence as `NotFound`.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
    /// Full replace guarded by `metadata.resourceVersion`.
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>, StoreError>;
    /// Claims in `namespace` carrying every label in `labels`.
    async fn list_claims(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<PersistentVolumeClaim>, StoreError>;
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError>;
    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError>;
}
