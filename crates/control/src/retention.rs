//! Retention policy engine: keeps claim owner references in line with the workload's
//! retention policy and the replica's place in the ordinal window.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use ordset_core::identity::persistent_volume_claims;
use ordset_core::retention::{claim_is_stale, owner_refs_match, set_claim_owner_refs, ClaimOwner};
use ordset_core::Workload;
use tracing::{debug, info};

use crate::{compute_replica_range, guarded, replica_name, Action, CancellationToken, ControlError, ReplicaControl};

fn claim_names(set: &Workload, ordinal: i32) -> Vec<String> {
    persistent_volume_claims(set, ordinal).into_values().filter_map(|c| c.metadata.name).collect()
}

impl ReplicaControl {
    /// Whether every claim of `pod` carries the owner expected for a live replica.
    /// A missing claim matches only when no owner is expected.
    pub async fn claims_match_retention_policy(&self, cx: &CancellationToken, set: &Workload, pod: &Pod) -> Result<bool, ControlError> {
        if !self.config.auto_delete_claims {
            return Ok(true);
        }
        let ordinal = Self::ordinal_of(pod)?;
        let expected = ClaimOwner::expected(set.retention_policy(), true).owner_refs(set, pod);
        for claim_name in claim_names(set, ordinal) {
            match guarded(cx, self.store.get_claim(set.namespace(), &claim_name)).await {
                Ok(Some(claim)) if !owner_refs_match(&claim, &expected) => return Ok(false),
                Ok(Some(_)) => {}
                Ok(None) if !expected.is_empty() => return Ok(false),
                Ok(None) => {}
                Err(e) => return Err(ControlError::RetentionDecision { replica: replica_name(pod).to_string(), source: e }),
            }
        }
        Ok(true)
    }

    /// Rewrite the owner references of `pod`'s claims to exactly the expected owner.
    /// Missing claims are skipped. Claims already in shape cost no write.
    pub async fn update_pod_claim_for_retention_policy(&self, cx: &CancellationToken, set: &Workload, pod: &Pod) -> Result<(), ControlError> {
        if !self.config.auto_delete_claims {
            return Ok(());
        }
        let name = replica_name(pod);
        let ordinal = Self::ordinal_of(pod)?;
        let live = compute_replica_range(set).is_live(ordinal);
        let owner = ClaimOwner::expected(set.retention_policy(), live);
        let expected = owner.owner_refs(set, pod);
        let mut first: Option<ControlError> = None;
        for claim_name in claim_names(set, ordinal) {
            let mut claim = match guarded(cx, self.store.get_claim(set.namespace(), &claim_name)).await {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    self.record_claim_event(set, Action::Update, name, &claim_name, Some(&e));
                    let stop = e.is_cancelled();
                    first.get_or_insert(ControlError::RetentionDecision { replica: name.to_string(), source: e });
                    if stop {
                        break;
                    }
                    continue;
                }
            };
            if !set_claim_owner_refs(&mut claim, &expected) {
                continue;
            }
            match guarded(cx, self.store.update_claim(&claim)).await {
                Ok(_) => {
                    counter!("claim_owner_update_ok", 1u64);
                    info!(ns = %set.namespace(), pod = %name, claim = %claim_name, owner = ?owner, live, "claim owner updated");
                    self.record_claim_event(set, Action::Update, name, &claim_name, None);
                }
                Err(e) => {
                    counter!("claim_owner_update_err", 1u64);
                    self.record_claim_event(set, Action::Update, name, &claim_name, Some(&e));
                    let stop = e.is_cancelled();
                    first.get_or_insert(ControlError::ClaimUpdateFailed { replica: name.to_string(), claim: claim_name, source: e });
                    if stop {
                        break;
                    }
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Whether any claim of `pod` still names an earlier replica with the same name.
    pub async fn pod_claim_is_stale(&self, cx: &CancellationToken, set: &Workload, pod: &Pod) -> Result<bool, ControlError> {
        let ordinal = Self::ordinal_of(pod)?;
        for claim_name in claim_names(set, ordinal) {
            match guarded(cx, self.store.get_claim(set.namespace(), &claim_name)).await {
                Ok(Some(claim)) if claim_is_stale(&claim, pod) => {
                    debug!(ns = %set.namespace(), pod = %replica_name(pod), claim = %claim_name, "stale claim");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => return Err(ControlError::RetentionDecision { replica: replica_name(pod).to_string(), source: e }),
            }
        }
        Ok(false)
    }
}
