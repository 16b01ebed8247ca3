//! Ordset control: per-replica lifecycle operations against a `ClusterStore`.
//!
//! `ReplicaControl` creates, corrects and deletes one replica at a time and keeps the
//! replica's claims owned per the workload retention policy. It holds no state between
//! calls; every decision is recomputed from the snapshots passed in.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use ordset_core::events::{reason, EventRecorder, Severity};
use ordset_core::identity::{identity_matches, persistent_volume_claims, pod_ordinal, storage_matches, update_identity, update_storage};
use ordset_core::retention::{is_terminating, set_claim_owner_refs, ClaimOwner};
use ordset_core::store::{ClusterStore, StoreError};
use ordset_core::Workload;
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod mem;
pub mod retention;

pub use config::ControlConfig;
pub use error::ControlError;
pub use mem::{MemStore, Verb};
pub use ordset_core::ordinals::compute_replica_range;
pub use tokio_util::sync::CancellationToken;

/// Replica updates are tried at most this many times; only a conflict earns a retry.
pub const MAX_UPDATE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    fn reason(&self, ok: bool) -> &'static str {
        match (self, ok) {
            (Action::Create, true) => reason::SUCCESSFUL_CREATE,
            (Action::Create, false) => reason::FAILED_CREATE,
            (Action::Update, true) => reason::SUCCESSFUL_UPDATE,
            (Action::Update, false) => reason::FAILED_UPDATE,
            (Action::Delete, true) => reason::SUCCESSFUL_DELETE,
            (Action::Delete, false) => reason::FAILED_DELETE,
        }
    }
}

/// Await a store call unless `cx` fires first.
pub(crate) async fn guarded<T, F>(cx: &CancellationToken, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cx.cancelled() => Err(StoreError::Cancelled),
        r = call => r,
    }
}

pub(crate) fn replica_name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or_default() }

pub struct ReplicaControl {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) config: ControlConfig,
}

impl ReplicaControl {
    pub fn new(store: Arc<dyn ClusterStore>, recorder: Arc<dyn EventRecorder>, config: ControlConfig) -> Self {
        Self { store, recorder, config }
    }

    pub fn config(&self) -> &ControlConfig { &self.config }

    pub(crate) fn ordinal_of(pod: &Pod) -> Result<i32, ControlError> {
        pod_ordinal(pod).ok_or_else(|| ControlError::InvalidReplicaName(replica_name(pod).to_string()))
    }

    pub(crate) fn record_replica_event(&self, set: &Workload, action: Action, pod: &str, err: Option<&dyn Display>) {
        let (severity, message) = match err {
            None => (Severity::Normal, format!("{} Pod {} in {} {} successful", action.as_str(), pod, ordset_core::WORKLOAD_KIND, set.name())),
            Some(e) => (Severity::Warning, format!("{} Pod {} in {} {} failed error: {}", action.as_str(), pod, ordset_core::WORKLOAD_KIND, set.name(), e)),
        };
        self.recorder.record(&set.object_ref(), severity, action.reason(err.is_none()), message);
    }

    pub(crate) fn record_claim_event(&self, set: &Workload, action: Action, pod: &str, claim: &str, err: Option<&dyn Display>) {
        let kind = ordset_core::WORKLOAD_KIND;
        let (severity, message) = match err {
            None => (Severity::Normal, format!("{} Claim {} Pod {} in {} {} success", action.as_str(), claim, pod, kind, set.name())),
            Some(e) => (Severity::Warning, format!("{} Claim {} for Pod {} in {} {} failed error: {}", action.as_str(), claim, pod, kind, set.name(), e)),
        };
        self.recorder.record(&set.object_ref(), severity, action.reason(err.is_none()), message);
    }

    /// Create every missing claim of `pod`. Existing claims are left alone unless they are
    /// terminating. Failures do not stop the walk (except cancellation); the first is returned.
    async fn ensure_claims(&self, cx: &CancellationToken, set: &Workload, pod: &Pod, ordinal: i32) -> Result<(), ControlError> {
        let name = replica_name(pod);
        let live = compute_replica_range(set).is_live(ordinal);
        let owners = if self.config.auto_delete_claims && live {
            ClaimOwner::expected(set.retention_policy(), true).owner_refs(set, pod)
        } else {
            Default::default()
        };
        let mut first: Option<ControlError> = None;
        for (_, mut claim) in persistent_volume_claims(set, ordinal) {
            let claim_name = claim.metadata.name.clone().unwrap_or_default();
            let outcome = match guarded(cx, self.store.get_claim(set.namespace(), &claim_name)).await {
                Ok(Some(existing)) if is_terminating(&existing) => {
                    warn!(ns = %set.namespace(), pod = %name, claim = %claim_name, "claim is terminating");
                    Err(ControlError::ClaimTerminating { replica: name.to_string(), claim: claim_name })
                }
                Ok(Some(_)) => Ok(()),
                Ok(None) => {
                    set_claim_owner_refs(&mut claim, &owners);
                    match guarded(cx, self.store.create_claim(&claim)).await {
                        Ok(_) => {
                            counter!("claim_create_ok", 1u64);
                            info!(ns = %set.namespace(), pod = %name, claim = %claim_name, "claim created");
                            self.record_claim_event(set, Action::Create, name, &claim_name, None);
                            Ok(())
                        }
                        // lost a race with another writer; the claim is there
                        Err(e) if e.is_already_exists() => Ok(()),
                        Err(e) => {
                            counter!("claim_create_err", 1u64);
                            self.record_claim_event(set, Action::Create, name, &claim_name, Some(&e));
                            Err(ControlError::ClaimCreateFailed { replica: name.to_string(), claim: claim_name, source: e })
                        }
                    }
                }
                Err(e) => {
                    counter!("claim_create_err", 1u64);
                    self.record_claim_event(set, Action::Create, name, &claim_name, Some(&e));
                    Err(ControlError::ClaimCreateFailed { replica: name.to_string(), claim: claim_name, source: e })
                }
            };
            if let Err(e) = outcome {
                let stop = e.is_cancelled();
                first.get_or_insert(e);
                if stop {
                    break;
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Create the claims of `pod`, then `pod` itself. Returns the stored replica.
    pub async fn create_replica(&self, cx: &CancellationToken, set: &Workload, pod: &Pod) -> Result<Pod, ControlError> {
        let name = replica_name(pod);
        let ordinal = Self::ordinal_of(pod)?;
        if let Err(e) = self.ensure_claims(cx, set, pod, ordinal).await {
            self.record_replica_event(set, Action::Create, name, Some(&e));
            return Err(e);
        }
        match guarded(cx, self.store.create_pod(pod)).await {
            Ok(created) => {
                counter!("replica_create_ok", 1u64);
                info!(ns = %set.namespace(), set = %set.name(), pod = %name, "replica created");
                self.record_replica_event(set, Action::Create, name, None);
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(ns = %set.namespace(), pod = %name, "replica already exists");
                Err(ControlError::ReplicaCreateFailed { replica: name.to_string(), source: e })
            }
            Err(e) => {
                counter!("replica_create_err", 1u64);
                warn!(ns = %set.namespace(), pod = %name, error = %e, "replica create failed");
                self.record_replica_event(set, Action::Create, name, Some(&e));
                Err(ControlError::ReplicaCreateFailed { replica: name.to_string(), source: e })
            }
        }
    }

    /// Bring `pod`'s identity, storage and claim ownership in line with `set`.
    ///
    /// On success `pod` holds the corrected replica; on failure it is left untouched.
    /// Events, errors and the re-read after a conflict all use the corrected name.
    pub async fn update_replica(&self, cx: &CancellationToken, set: &Workload, pod: &mut Pod) -> Result<(), ControlError> {
        let ordinal = Self::ordinal_of(pod)?;
        let mut candidate = pod.clone();
        let mut attempt = 0;
        // a correction that failed to land and could not be re-read still has to be written
        let mut unwritten = false;
        loop {
            attempt += 1;
            let mut consistent = !unwritten;
            if !identity_matches(set, &candidate) {
                update_identity(set, &mut candidate, ordinal);
                consistent = false;
            }
            let name = replica_name(&candidate).to_string();
            if !storage_matches(set, &candidate) {
                update_storage(set, &mut candidate, ordinal);
                if let Err(e) = self.ensure_claims(cx, set, &candidate, ordinal).await {
                    self.record_replica_event(set, Action::Update, &name, Some(&e));
                    return Err(e);
                }
                consistent = false;
            }
            if self.config.auto_delete_claims {
                let converged = match self.claims_match_retention_policy(cx, set, &candidate).await {
                    Ok(true) => Ok(()),
                    Ok(false) => self.update_pod_claim_for_retention_policy(cx, set, &candidate).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = converged {
                    self.record_replica_event(set, Action::Update, &name, Some(&e));
                    return Err(e);
                }
            }
            if consistent {
                *pod = candidate;
                return Ok(());
            }
            match guarded(cx, self.store.update_pod(&candidate)).await {
                Ok(updated) => {
                    counter!("replica_update_ok", 1u64);
                    info!(ns = %set.namespace(), set = %set.name(), pod = %name, attempt, "replica updated");
                    self.record_replica_event(set, Action::Update, &name, None);
                    *pod = updated;
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < MAX_UPDATE_ATTEMPTS => {
                    counter!("replica_update_conflict", 1u64);
                    debug!(ns = %set.namespace(), pod = %name, "update conflict; re-reading replica");
                    match guarded(cx, self.store.get_pod(set.namespace(), &name)).await {
                        Ok(Some(fresh)) => {
                            candidate = fresh;
                            unwritten = false;
                        }
                        Ok(None) => unwritten = true,
                        Err(err) => {
                            warn!(ns = %set.namespace(), pod = %name, error = %err, "re-read after conflict failed");
                            unwritten = true;
                        }
                    }
                }
                Err(e) => {
                    counter!("replica_update_err", 1u64);
                    warn!(ns = %set.namespace(), pod = %name, error = %e, attempt, "replica update failed");
                    self.record_replica_event(set, Action::Update, &name, Some(&e));
                    return Err(ControlError::ReplicaUpdateFailed { replica: name, source: e });
                }
            }
        }
    }

    pub async fn delete_replica(&self, cx: &CancellationToken, set: &Workload, pod: &Pod) -> Result<(), ControlError> {
        let name = replica_name(pod);
        let ns = pod.metadata.namespace.as_deref().unwrap_or(set.namespace());
        match guarded(cx, self.store.delete_pod(ns, name)).await {
            Ok(()) => {
                counter!("replica_delete_ok", 1u64);
                info!(ns = %ns, set = %set.name(), pod = %name, "replica deleted");
                self.record_replica_event(set, Action::Delete, name, None);
                Ok(())
            }
            Err(e) => {
                counter!("replica_delete_err", 1u64);
                warn!(ns = %ns, pod = %name, error = %e, "replica delete failed");
                self.record_replica_event(set, Action::Delete, name, Some(&e));
                Err(ControlError::ReplicaDeleteFailed { replica: name.to_string(), source: e })
            }
        }
    }
}
