//! Replica identity and storage: naming, drift checks and in-place corrections.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Workload, POD_INDEX_LABEL, POD_NAME_LABEL};

static ORDINAL_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*)-([0-9]+)$").expect("static regex"));

pub fn pod_name(set: &Workload, ordinal: i32) -> String { format!("{}-{}", set.name(), ordinal) }

/// Name of the claim instantiated from `template` for `ordinal`.
pub fn claim_name(set: &Workload, template: &PersistentVolumeClaim, ordinal: i32) -> String {
    format!("{}-{}-{}", template.metadata.name.as_deref().unwrap_or_default(), set.name(), ordinal)
}

/// Split `<parent>-<ordinal>` into its parts.
pub fn parent_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let caps = ORDINAL_SUFFIX.captures(name)?;
    let parent = caps.get(1)?.as_str();
    let ordinal = caps.get(2)?.as_str().parse::<i32>().ok()?;
    Some((parent, ordinal))
}

pub fn pod_ordinal(pod: &Pod) -> Option<i32> {
    parent_and_ordinal(pod.metadata.name.as_deref().unwrap_or_default()).map(|(_, o)| o)
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
}

/// True when name, namespace, identity labels and network identity all follow from
/// `(set, ordinal)`.
pub fn identity_matches(set: &Workload, pod: &Pod) -> bool {
    let Some(name) = pod.metadata.name.as_deref() else { return false };
    let Some((parent, ordinal)) = parent_and_ordinal(name) else { return false };
    let ordinal_label = ordinal.to_string();
    let spec = pod.spec.as_ref();
    parent == set.name()
        && name == pod_name(set, ordinal)
        && pod.metadata.namespace.as_deref().unwrap_or_default() == set.namespace()
        && label(pod, POD_NAME_LABEL) == Some(name)
        && label(pod, POD_INDEX_LABEL) == Some(ordinal_label.as_str())
        && spec.and_then(|s| s.hostname.as_deref()) == Some(name)
        && spec.and_then(|s| s.subdomain.as_deref()).unwrap_or_default() == set.spec.service_name
}

/// Rewrite the identity fields of `pod` for `ordinal`.
pub fn update_identity(set: &Workload, pod: &mut Pod, ordinal: i32) {
    let name = pod_name(set, ordinal);
    pod.metadata.name = Some(name.clone());
    pod.metadata.namespace = Some(set.namespace().to_string());
    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(POD_NAME_LABEL.to_string(), name.clone());
    labels.insert(POD_INDEX_LABEL.to_string(), ordinal.to_string());
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    spec.hostname = Some(name);
    spec.subdomain = if set.spec.service_name.is_empty() { None } else { Some(set.spec.service_name.clone()) };
}

/// Claims for `ordinal`, keyed by template name (the volume name they mount as).
pub fn persistent_volume_claims(set: &Workload, ordinal: i32) -> BTreeMap<String, PersistentVolumeClaim> {
    let selector = set.selector_labels();
    set.spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata.name = Some(claim_name(set, template, ordinal));
            claim.metadata.namespace = Some(set.namespace().to_string());
            let labels = claim.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.extend(selector.clone());
            (template.metadata.name.clone().unwrap_or_default(), claim)
        })
        .collect()
}

/// True when every template is mounted under its own name and bound to the claim
/// derived for the pod's ordinal.
pub fn storage_matches(set: &Workload, pod: &Pod) -> bool {
    let Some(ordinal) = pod_ordinal(pod) else { return false };
    let volumes: BTreeMap<&str, &Volume> = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|vs| vs.iter().map(|v| (v.name.as_str(), v)).collect())
        .unwrap_or_default();
    set.spec.volume_claim_templates.iter().all(|template| {
        let vol_name = template.metadata.name.as_deref().unwrap_or_default();
        volumes
            .get(vol_name)
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .map(|src| src.claim_name == claim_name(set, template, ordinal))
            .unwrap_or(false)
    })
}

/// Mount every template claim; volumes not backed by a template are kept after them.
pub fn update_storage(set: &Workload, pod: &mut Pod, ordinal: i32) {
    let claims = persistent_volume_claims(set, ordinal);
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    let current = spec.volumes.take().unwrap_or_default();
    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(vol_name, claim)| Volume {
            name: vol_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.metadata.name.clone().unwrap_or_default(),
                read_only: Some(false),
            }),
            ..Default::default()
        })
        .collect();
    volumes.extend(current.into_iter().filter(|v| !claims.contains_key(&v.name)));
    spec.volumes = Some(volumes);
}

/// Build the replica for `ordinal` from the workload template.
pub fn new_replica(set: &Workload, ordinal: i32) -> Pod {
    let template_meta = set.spec.template.metadata.clone().unwrap_or_default();
    let mut pod = Pod {
        metadata: ObjectMeta {
            labels: template_meta.labels,
            annotations: template_meta.annotations,
            owner_references: Some(vec![set.controller_ref()]),
            ..Default::default()
        },
        spec: set.spec.template.spec.clone(),
        status: None,
    };
    update_identity(set, &mut pod, ordinal);
    update_storage(set, &mut pod, ordinal);
    pod
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn set_with_claims() -> Workload {
        let mut set = Workload::new("default", "foo", 3);
        set.spec.service_name = "governing".into();
        set.spec.selector = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "foo".to_string())])),
            ..Default::default()
        });
        set.spec.volume_claim_templates = vec![PersistentVolumeClaim {
            metadata: ObjectMeta { name: Some("datadir".into()), ..Default::default() },
            ..Default::default()
        }];
        set.spec.template.spec = Some(PodSpec {
            volumes: Some(vec![Volume { name: "home".into(), ..Default::default() }]),
            ..Default::default()
        });
        set
    }

    #[test]
    fn parses_parent_and_ordinal() {
        assert_eq!(parent_and_ordinal("foo-0"), Some(("foo", 0)));
        assert_eq!(parent_and_ordinal("my-set-12"), Some(("my-set", 12)));
        assert_eq!(parent_and_ordinal("foo"), None);
        assert_eq!(parent_and_ordinal("foo-x"), None);
        assert_eq!(parent_and_ordinal("foo-+1"), None);
    }

    #[test]
    fn new_replica_has_identity_and_storage() {
        let set = set_with_claims();
        let pod = new_replica(&set, 2);
        assert_eq!(pod.metadata.name.as_deref(), Some("foo-2"));
        assert!(identity_matches(&set, &pod));
        assert!(storage_matches(&set, &pod));
        let vols = pod.spec.as_ref().and_then(|s| s.volumes.as_ref()).expect("volumes");
        assert_eq!(vols.len(), 2);
        assert_eq!(vols[0].persistent_volume_claim.as_ref().map(|s| s.claim_name.as_str()), Some("datadir-foo-2"));
        assert_eq!(vols[1].name, "home");
    }

    #[test]
    fn identity_drift_is_detected_and_corrected() {
        let set = set_with_claims();
        let mut pod = new_replica(&set, 0);
        pod.metadata.name = Some("goo-0".into());
        assert!(!identity_matches(&set, &pod));
        update_identity(&set, &mut pod, 0);
        assert!(identity_matches(&set, &pod));

        let mut pod = new_replica(&set, 1);
        if let Some(l) = pod.metadata.labels.as_mut() {
            l.insert(POD_NAME_LABEL.into(), "goo-starts".into());
        }
        assert!(!identity_matches(&set, &pod));

        let mut pod = new_replica(&set, 1);
        if let Some(s) = pod.spec.as_mut() {
            s.subdomain = None;
        }
        assert!(!identity_matches(&set, &pod));

        let mut pod = new_replica(&set, 1);
        pod.metadata.namespace = Some("other".into());
        assert!(!identity_matches(&set, &pod));
    }

    #[test]
    fn storage_drift_is_detected_and_corrected() {
        let set = set_with_claims();
        let mut pod = new_replica(&set, 0);
        if let Some(v) = pod.spec.as_mut().and_then(|s| s.volumes.as_mut()) {
            v.retain(|v| v.name != "datadir");
        }
        assert!(!storage_matches(&set, &pod));
        update_storage(&set, &mut pod, 0);
        assert!(storage_matches(&set, &pod));

        let mut pod = new_replica(&set, 0);
        if let Some(src) = pod.spec.as_mut().and_then(|s| s.volumes.as_mut()).and_then(|v| v[0].persistent_volume_claim.as_mut()) {
            src.claim_name = "datadir-foo-7".into();
        }
        assert!(!storage_matches(&set, &pod));
    }

    #[test]
    fn claims_carry_selector_labels() {
        let set = set_with_claims();
        let claims = persistent_volume_claims(&set, 4);
        let claim = claims.get("datadir").expect("claim");
        assert_eq!(claim.metadata.name.as_deref(), Some("datadir-foo-4"));
        assert_eq!(claim.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(claim.metadata.labels.as_ref().and_then(|l| l.get("app")).map(|s| s.as_str()), Some("foo"));
    }
}
