#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use ordset_control::{CancellationToken, ControlConfig, MemStore, ReplicaControl};
use ordset_core::events::{drain_events, ChannelRecorder, RecordedEvent, Severity};
use ordset_core::identity::persistent_volume_claims;
use ordset_core::{RetentionPolicy, RetentionPolicyType, Workload};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn init_test_tracing() {
    let env = std::env::var("ORDSET_LOG").unwrap_or_else(|_| "warn".into());
    let filter = tracing_subscriber::EnvFilter::try_new(env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Workload `foo` in `default` with one claim template (`datadir`) and one plain volume (`home`).
pub fn new_set(replicas: i32) -> Workload {
    let mut set = Workload::new("default", "foo", replicas);
    set.metadata.uid = Some("set-123".into());
    set.spec.service_name = "governingsvc".into();
    set.spec.selector = Some(LabelSelector {
        match_labels: Some(BTreeMap::from([("foo".to_string(), "bar".to_string())])),
        ..Default::default()
    });
    set.spec.template.metadata = Some(ObjectMeta {
        labels: Some(BTreeMap::from([("foo".to_string(), "bar".to_string())])),
        ..Default::default()
    });
    set.spec.template.spec = Some(PodSpec {
        volumes: Some(vec![Volume { name: "home".into(), ..Default::default() }]),
        ..Default::default()
    });
    set.spec.volume_claim_templates = vec![PersistentVolumeClaim {
        metadata: ObjectMeta { name: Some("datadir".into()), ..Default::default() },
        ..Default::default()
    }];
    set
}

pub fn with_policy(mut set: Workload, when_deleted: RetentionPolicyType, when_scaled: RetentionPolicyType) -> Workload {
    set.spec.retention_policy = Some(RetentionPolicy::new(when_deleted, when_scaled));
    set
}

pub fn claims_for(set: &Workload, ordinal: i32) -> Vec<PersistentVolumeClaim> {
    persistent_volume_claims(set, ordinal).into_values().collect()
}

pub fn claim_name(claim: &PersistentVolumeClaim) -> &str { claim.metadata.name.as_deref().unwrap_or_default() }

pub fn pod_name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or_default() }

pub struct Harness {
    pub store: Arc<MemStore>,
    pub control: ReplicaControl,
    pub rx: UnboundedReceiver<RecordedEvent>,
    pub cx: CancellationToken,
}

impl Harness {
    pub fn new() -> Self { Self::with_config(ControlConfig::default()) }

    pub fn with_config(config: ControlConfig) -> Self {
        init_test_tracing();
        let store = Arc::new(MemStore::new());
        let (recorder, rx) = ChannelRecorder::new();
        let control = ReplicaControl::new(store.clone(), Arc::new(recorder), config);
        Self { store, control, rx, cx: CancellationToken::new() }
    }

    pub fn events(&mut self) -> Vec<RecordedEvent> { drain_events(&mut self.rx) }

    /// Seed the claims of `ordinal` as they would be created without owner references.
    pub fn seed_claims(&self, set: &Workload, ordinal: i32) -> Vec<PersistentVolumeClaim> {
        claims_for(set, ordinal).into_iter().map(|c| self.store.insert_claim(c)).collect()
    }
}

pub fn count(events: &[RecordedEvent], severity: Severity) -> usize { events.iter().filter(|e| e.severity == severity).count() }

pub fn all(events: &[RecordedEvent], severity: Severity) -> bool { events.iter().all(|e| e.severity == severity) }
