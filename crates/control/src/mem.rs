//! In-memory `ClusterStore` with resourceVersion checks, fault injection and call
//! counting. Drives the control test suites; also usable as a dry-run backend.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use ordset_core::store::{ClusterStore, StoreError};
use ordset_core::ObjectKind;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
}

type Key = (String, String);

#[derive(Default)]
struct Inner {
    pods: FxHashMap<Key, Pod>,
    claims: FxHashMap<Key, PersistentVolumeClaim>,
    next: FxHashMap<(ObjectKind, Verb), VecDeque<StoreError>>,
    always: FxHashMap<(ObjectKind, Verb), StoreError>,
    stalled: FxHashSet<(ObjectKind, Verb)>,
    calls: FxHashMap<(ObjectKind, Verb), usize>,
    version: u64,
}

impl Inner {
    /// Count the call and pop any injected failure for it.
    fn enter(&mut self, kind: ObjectKind, verb: Verb) -> Result<(), StoreError> {
        *self.calls.entry((kind, verb)).or_default() += 1;
        if let Some(e) = self.next.get_mut(&(kind, verb)).and_then(|q| q.pop_front()) {
            return Err(e);
        }
        match self.always.get(&(kind, verb)) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn key(meta: &ObjectMeta) -> Key {
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

fn mk(namespace: &str, name: &str) -> Key { (namespace.to_string(), name.to_string()) }

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Fail the next matching call with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, kind: ObjectKind, verb: Verb, err: StoreError) {
        self.lock().next.entry((kind, verb)).or_default().push_back(err);
    }

    /// Fail every matching call with `err` until `clear_faults`.
    pub fn fail_always(&self, kind: ObjectKind, verb: Verb, err: StoreError) { self.lock().always.insert((kind, verb), err); }

    /// Matching calls never complete.
    pub fn stall(&self, kind: ObjectKind, verb: Verb) { self.lock().stalled.insert((kind, verb)); }

    pub fn clear_faults(&self) {
        let mut g = self.lock();
        g.next.clear();
        g.always.clear();
        g.stalled.clear();
    }

    pub fn calls(&self, kind: ObjectKind, verb: Verb) -> usize { self.lock().calls.get(&(kind, verb)).copied().unwrap_or(0) }

    /// Create, update and delete calls across all kinds, failed ones included.
    pub fn writes(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|((_, v), _)| matches!(v, Verb::Create | Verb::Update | Verb::Delete))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn reset_calls(&self) { self.lock().calls.clear(); }

    /// Seed a replica without counting a call. Assigns a resourceVersion when missing.
    pub fn insert_pod(&self, mut pod: Pod) -> Pod {
        let mut g = self.lock();
        if pod.metadata.resource_version.is_none() {
            pod.metadata.resource_version = Some(g.bump());
        }
        g.pods.insert(key(&pod.metadata), pod.clone());
        pod
    }

    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let mut g = self.lock();
        if claim.metadata.resource_version.is_none() {
            claim.metadata.resource_version = Some(g.bump());
        }
        g.claims.insert(key(&claim.metadata), claim.clone());
        claim
    }

    /// Set the deletion timestamp on a stored claim. Returns false when absent.
    pub fn mark_claim_terminating(&self, namespace: &str, name: &str) -> bool {
        match self.lock().claims.get_mut(&mk(namespace, name)) {
            Some(c) => {
                c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                true
            }
            None => false,
        }
    }

    /// Bump a stored replica's resourceVersion as a concurrent writer would.
    pub fn touch_pod(&self, namespace: &str, name: &str) {
        let mut g = self.lock();
        let rv = g.bump();
        if let Some(p) = g.pods.get_mut(&mk(namespace, name)) {
            p.metadata.resource_version = Some(rv);
        }
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> { self.lock().pods.get(&mk(namespace, name)).cloned() }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().claims.get(&mk(namespace, name)).cloned()
    }

    pub fn claims(&self) -> Vec<PersistentVolumeClaim> {
        let mut out: Vec<_> = self.lock().claims.values().cloned().collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out
    }

    async fn gate(&self, kind: ObjectKind, verb: Verb) -> Result<(), StoreError> {
        let stalled = {
            let mut g = self.lock();
            g.enter(kind, verb)?;
            g.stalled.contains(&(kind, verb))
        };
        if stalled {
            debug!(kind = %kind, verb = ?verb, "store call stalled");
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, StoreError> {
        self.gate(ObjectKind::Replica, Verb::Get).await?;
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.gate(ObjectKind::Replica, Verb::Create).await?;
        let mut g = self.lock();
        let k = key(&pod.metadata);
        if g.pods.contains_key(&k) {
            return Err(StoreError::AlreadyExists { kind: ObjectKind::Replica, name: k.1 });
        }
        let mut created = pod.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(g.bump());
        g.pods.insert(k, created.clone());
        Ok(created)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.gate(ObjectKind::Replica, Verb::Update).await?;
        let mut g = self.lock();
        let k = key(&pod.metadata);
        let Some(current) = g.pods.get(&k) else {
            return Err(StoreError::NotFound { kind: ObjectKind::Replica, name: k.1 });
        };
        if pod.metadata.resource_version.is_some() && pod.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::conflict(ObjectKind::Replica, &k.1));
        }
        let uid = current.metadata.uid.clone();
        let mut updated = pod.clone();
        updated.metadata.uid = uid;
        updated.metadata.resource_version = Some(g.bump());
        g.pods.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.gate(ObjectKind::Replica, Verb::Delete).await?;
        match self.lock().pods.remove(&mk(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound { kind: ObjectKind::Replica, name: name.to_string() }),
        }
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        self.gate(ObjectKind::Claim, Verb::Get).await?;
        Ok(self.claim(namespace, name))
    }

    async fn list_claims(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        self.gate(ObjectKind::Claim, Verb::List).await?;
        Ok(self
            .claims()
            .into_iter()
            .filter(|c| c.metadata.namespace.as_deref().unwrap_or_default() == namespace)
            .filter(|c| {
                let have = c.metadata.labels.as_ref();
                labels.iter().all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
            })
            .collect())
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError> {
        self.gate(ObjectKind::Claim, Verb::Create).await?;
        let mut g = self.lock();
        let k = key(&claim.metadata);
        if g.claims.contains_key(&k) {
            return Err(StoreError::AlreadyExists { kind: ObjectKind::Claim, name: k.1 });
        }
        let mut created = claim.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(g.bump());
        g.claims.insert(k, created.clone());
        Ok(created)
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, StoreError> {
        self.gate(ObjectKind::Claim, Verb::Update).await?;
        let mut g = self.lock();
        let k = key(&claim.metadata);
        let Some(current) = g.claims.get(&k) else {
            return Err(StoreError::NotFound { kind: ObjectKind::Claim, name: k.1 });
        };
        if claim.metadata.resource_version.is_some() && claim.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::conflict(ObjectKind::Claim, &k.1));
        }
        let uid = current.metadata.uid.clone();
        let mut updated = claim.clone();
        updated.metadata.uid = uid;
        updated.metadata.resource_version = Some(g.bump());
        g.claims.insert(k, updated.clone());
        Ok(updated)
    }
}
