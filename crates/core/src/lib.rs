//! Ordset core types: the ordinal workload model and the rules shared by every
//! controller component (ordinal windows, replica identity, claim retention).

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod identity;
pub mod ordinals;
pub mod retention;
pub mod store;

pub mod prelude {
    pub use super::events::{ChannelRecorder, EventRecorder, NoopRecorder, RecordedEvent, Severity, TracingRecorder};
    pub use super::ordinals::{compute_replica_range, OrdinalWindow, ReservedSet, ReservedSpec};
    pub use super::retention::ClaimOwner;
    pub use super::store::{ClusterStore, StoreError};
    pub use super::{ObjectKind, RetentionPolicy, RetentionPolicyType, Workload, WorkloadSpec};
}

/// API version written into owner references that point at a workload.
pub const WORKLOAD_API_VERSION: &str = "apps.ordset.io/v1beta1";
pub const WORKLOAD_KIND: &str = "OrdinalSet";

/// Stable identity label: always equal to the replica's own name.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";
/// Ordinal label carried next to the identity label.
pub const POD_INDEX_LABEL: &str = "apps.kubernetes.io/pod-index";

/// Closed set of object kinds this core reads or writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Workload,
    Replica,
    Claim,
}

impl ObjectKind {
    /// Kind name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Workload => WORKLOAD_KIND,
            ObjectKind::Replica => "Pod",
            ObjectKind::Claim => "PersistentVolumeClaim",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ObjectKind::Workload => WORKLOAD_API_VERSION,
            ObjectKind::Replica | ObjectKind::Claim => "v1",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum RetentionPolicyType {
    #[default]
    Retain,
    Delete,
}

/// Claim retention policy. `when_deleted` applies to live ordinals, `when_scaled`
/// to ordinals outside the live window (scaled away or reserved).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub when_deleted: RetentionPolicyType,
    #[serde(default)]
    pub when_scaled: RetentionPolicyType,
}

impl RetentionPolicy {
    pub fn new(when_deleted: RetentionPolicyType, when_scaled: RetentionPolicyType) -> Self {
        Self { when_deleted, when_scaled }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Ordinals {
    #[serde(default)]
    pub start: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Desired live replicas; `None` means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, rename = "persistentVolumeClaimRetentionPolicy", skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    /// Ordinals skipped when placing replicas: integers or "a-b" ranges.
    #[serde(default)]
    pub reserve_ordinals: Vec<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinals: Option<Ordinals>,
}

/// The parent workload. Read-only input to every operation in this workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
}

impl Workload {
    pub fn new(namespace: &str, name: &str, replicas: i32) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: WorkloadSpec { replicas: Some(replicas), ..Default::default() },
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or_default() }
    pub fn uid(&self) -> &str { self.metadata.uid.as_deref().unwrap_or_default() }

    pub fn replicas(&self) -> i32 { self.spec.replicas.unwrap_or(1).max(0) }
    pub fn start_ordinal(&self) -> i32 { self.spec.ordinals.map(|o| o.start).unwrap_or(0).max(0) }
    pub fn retention_policy(&self) -> RetentionPolicy { self.spec.retention_policy.unwrap_or_default() }

    /// Labels every claim of this workload carries (the selector's match labels).
    pub fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.spec
            .selector
            .as_ref()
            .and_then(|s| s.match_labels.clone())
            .unwrap_or_default()
    }

    /// Owner reference naming this workload, as written onto claims.
    pub fn owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: WORKLOAD_API_VERSION.to_string(),
            kind: WORKLOAD_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            ..Default::default()
        }
    }

    /// Controller reference stamped on replicas created from this workload.
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference { controller: Some(true), block_owner_deletion: Some(true), ..self.owner_ref() }
    }

    /// Involved-object reference used for events.
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(WORKLOAD_API_VERSION.to_string()),
            kind: Some(WORKLOAD_KIND.to_string()),
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            uid: self.metadata.uid.clone(),
            resource_version: self.metadata.resource_version.clone(),
            ..Default::default()
        }
    }
}
