//! Claim retention: who should own a replica's claims, and whether a claim still
//! points at an earlier occupant of the same ordinal.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use smallvec::SmallVec;

use crate::{ObjectKind, RetentionPolicy, RetentionPolicyType, Workload};

/// Expected owner of a claim. At most one owner is ever expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimOwner {
    Workload,
    Replica,
    None,
}

pub type OwnerRefs = SmallVec<[OwnerReference; 1]>;

impl ClaimOwner {
    /// `live`: the ordinal is inside the window and not reserved.
    pub fn expected(policy: RetentionPolicy, live: bool) -> Self {
        match (live, policy.when_deleted, policy.when_scaled) {
            (true, RetentionPolicyType::Delete, _) => ClaimOwner::Workload,
            (true, RetentionPolicyType::Retain, _) => ClaimOwner::None,
            (false, _, RetentionPolicyType::Delete) => ClaimOwner::Replica,
            (false, _, RetentionPolicyType::Retain) => ClaimOwner::None,
        }
    }

    /// The exact owner reference list a converged claim carries.
    pub fn owner_refs(&self, set: &Workload, pod: &Pod) -> OwnerRefs {
        match self {
            ClaimOwner::Workload => SmallVec::from_elem(set.owner_ref(), 1),
            ClaimOwner::Replica => SmallVec::from_elem(replica_owner_ref(pod), 1),
            ClaimOwner::None => SmallVec::new(),
        }
    }
}

pub fn replica_owner_ref(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: ObjectKind::Replica.api_version().to_string(),
        kind: ObjectKind::Replica.as_str().to_string(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.api_version == b.api_version && a.kind == b.kind && a.name == b.name && a.uid == b.uid
}

/// Whether the claim's owner references are exactly `expected` (order-insensitive).
pub fn owner_refs_match(claim: &PersistentVolumeClaim, expected: &[OwnerReference]) -> bool {
    let current = claim.metadata.owner_references.as_deref().unwrap_or_default();
    current.len() == expected.len() && expected.iter().all(|e| current.iter().any(|c| same_owner(c, e)))
}

/// Rewrite the claim's owner references to `expected`. Returns false when nothing changed.
pub fn set_claim_owner_refs(claim: &mut PersistentVolumeClaim, expected: &[OwnerReference]) -> bool {
    if owner_refs_match(claim, expected) {
        return false;
    }
    claim.metadata.owner_references = if expected.is_empty() { None } else { Some(expected.to_vec()) };
    true
}

/// A claim is stale when it carries a reference to a replica with the same name but a
/// different uid. Unknown replica uid proves nothing, so any such reference is stale.
pub fn claim_is_stale(claim: &PersistentVolumeClaim, pod: &Pod) -> bool {
    let Some(name) = pod.metadata.name.as_deref() else { return false };
    let uid = pod.metadata.uid.as_deref().filter(|u| !u.is_empty());
    claim
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|r| r.name == name)
        .any(|r| uid.map_or(true, |u| r.uid != u))
}

pub fn is_terminating(claim: &PersistentVolumeClaim) -> bool { claim.metadata.deletion_timestamp.is_some() }

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use RetentionPolicyType::{Delete, Retain};

    fn pod(name: &str, uid: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), uid: uid.map(String::from), ..Default::default() },
            ..Default::default()
        }
    }

    fn claim(refs: Vec<OwnerReference>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("datadir-foo-0".into()),
                owner_references: if refs.is_empty() { None } else { Some(refs) },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn named_ref(name: &str, uid: &str) -> OwnerReference {
        OwnerReference { name: name.into(), uid: uid.into(), ..Default::default() }
    }

    #[test]
    fn expected_owner_covers_every_axis() {
        let cases = [
            (Retain, Retain, true, ClaimOwner::None),
            (Retain, Delete, true, ClaimOwner::None),
            (Delete, Retain, true, ClaimOwner::Workload),
            (Delete, Delete, true, ClaimOwner::Workload),
            (Retain, Retain, false, ClaimOwner::None),
            (Delete, Retain, false, ClaimOwner::None),
            (Retain, Delete, false, ClaimOwner::Replica),
            (Delete, Delete, false, ClaimOwner::Replica),
        ];
        for (when_deleted, when_scaled, live, want) in cases {
            let got = ClaimOwner::expected(RetentionPolicy::new(when_deleted, when_scaled), live);
            assert_eq!(got, want, "deleted={:?} scaled={:?} live={}", when_deleted, when_scaled, live);
        }
    }

    #[test]
    fn owner_refs_are_single_or_empty() {
        let mut set = Workload::new("default", "foo", 1);
        set.metadata.uid = Some("set-123".into());
        let p = pod("foo-0", Some("pod-1"));
        let w = ClaimOwner::Workload.owner_refs(&set, &p);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].uid, "set-123");
        let r = ClaimOwner::Replica.owner_refs(&set, &p);
        assert_eq!((r[0].api_version.as_str(), r[0].kind.as_str(), r[0].name.as_str(), r[0].uid.as_str()), ("v1", "Pod", "foo-0", "pod-1"));
        assert!(ClaimOwner::None.owner_refs(&set, &p).is_empty());
    }

    #[test]
    fn set_owner_refs_is_idempotent() {
        let set = Workload::new("default", "foo", 1);
        let want = vec![set.owner_ref()];
        let mut c = claim(vec![]);
        assert!(set_claim_owner_refs(&mut c, &want));
        assert!(!set_claim_owner_refs(&mut c, &want));
        assert!(owner_refs_match(&c, &want));
        assert!(set_claim_owner_refs(&mut c, &[]));
        assert_eq!(c.metadata.owner_references, None);
        assert!(owner_refs_match(&c, &[]));
    }

    #[test]
    fn extra_owner_is_a_mismatch() {
        let set = Workload::new("default", "foo", 1);
        let c = claim(vec![set.owner_ref(), named_ref("someone", "x")]);
        assert!(!owner_refs_match(&c, &[set.owner_ref()]));
    }

    #[test]
    fn staleness() {
        let p = pod("set-3", Some("123"));
        assert!(!claim_is_stale(&claim(vec![]), &p));
        assert!(!claim_is_stale(&claim(vec![named_ref("set-3", "123")]), &p));
        assert!(claim_is_stale(&claim(vec![named_ref("set-3", "stale")]), &p));
        assert!(!claim_is_stale(&claim(vec![named_ref("other", "stale")]), &p));
        // no uid on the replica: cannot prove freshness
        assert!(claim_is_stale(&claim(vec![named_ref("set-3", "123")]), &pod("set-3", None)));
        assert!(!claim_is_stale(&claim(vec![]), &pod("set-3", None)));
    }
}
