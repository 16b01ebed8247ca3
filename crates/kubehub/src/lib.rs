//! Ordset kubehub: the API-server backed `ClusterStore` and event recorder.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use metrics::counter;
use ordset_control::ControlConfig;
use ordset_core::events::{EventRecorder, Severity};
use ordset_core::store::{ClusterStore, StoreError};
use ordset_core::ObjectKind;
use tracing::{debug, info, warn};

/// Map a kube client error onto the store outcome classes.
pub fn store_error(kind: ObjectKind, name: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists { kind, name: name.to_string() },
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { kind, name: name.to_string(), message: ae.message },
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound { kind, name: name.to_string() },
        other => StoreError::transient(kind, name, other.to_string()),
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str { meta.name.as_deref().unwrap_or_default() }

fn object_namespace(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.namespace.as_deref().unwrap_or("default")
}

/// `ClusterStore` talking straight to the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect with the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        info!("kube store connected");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    fn pods(&self, ns: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), ns) }
    fn claims(&self, ns: &str) -> Api<PersistentVolumeClaim> { Api::namespaced(self.client.clone(), ns) }
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
        self.pods(namespace).get_opt(name).await.map_err(|e| store_error(ObjectKind::Replica, name, e))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let name = object_name(&pod.metadata);
        self.pods(object_namespace(&pod.metadata))
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| store_error(ObjectKind::Replica, name, e))
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let name = object_name(&pod.metadata);
        self.pods(object_namespace(&pod.metadata))
            .replace(name, &PostParams::default(), pod)
            .await
            .map_err(|e| store_error(ObjectKind::Replica, name, e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error(ObjectKind::Replica, name, e))
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        self.claims(namespace).get_opt(name).await.map_err(|e| store_error(ObjectKind::Claim, name, e))
    }

    async fn list_claims(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = self.claims(namespace).list(&lp).await.map_err(|e| store_error(ObjectKind::Claim, namespace, e))?;
        debug!(ns = %namespace, count = list.items.len(), "claims listed");
        Ok(list.items)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError> {
        let name = object_name(&claim.metadata);
        self.claims(object_namespace(&claim.metadata))
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| store_error(ObjectKind::Claim, name, e))
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError> {
        let name = object_name(&claim.metadata);
        self.claims(object_namespace(&claim.metadata))
            .replace(name, &PostParams::default(), claim)
            .await
            .map_err(|e| store_error(ObjectKind::Claim, name, e))
    }
}

/// Publishes events through `events.k8s.io`. Each publish runs on its own task; failures
/// are logged and dropped.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

/// Reporter identity for published events: the configured component name plus the
/// `POD_NAME` of the running controller, when known.
fn reporter_for(config: &ControlConfig, instance: Option<String>) -> Reporter {
    Reporter { controller: config.reporter.clone(), instance }
}

impl KubeEventRecorder {
    pub fn new(client: Client, config: &ControlConfig) -> Self {
        let reporter = reporter_for(config, std::env::var("POD_NAME").ok());
        info!(reporter = %reporter.controller, "kube event recorder ready");
        Self { client, reporter }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, involved: &ObjectReference, severity: Severity, reason: &str, message: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(reason = %reason, "no runtime; dropping event");
            return;
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), involved.clone());
        let event = Event {
            type_: match severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message),
            action: reason.to_string(),
            secondary: None,
        };
        let object = involved.name.clone().unwrap_or_default();
        handle.spawn(async move {
            match recorder.publish(event).await {
                Ok(()) => {
                    counter!("event_publish_ok", 1u64);
                }
                Err(e) => {
                    counter!("event_publish_err", 1u64);
                    warn!(object = %object, error = %e, "event publish failed");
                }
            }
        });
    }
}
