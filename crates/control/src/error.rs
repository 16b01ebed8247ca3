//! Control error taxonomy. Every variant that came out of a store call keeps it as source.

#![forbid(unsafe_code)]

use ordset_core::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("claim {claim} of replica {replica} is terminating")]
    ClaimTerminating { replica: String, claim: String },
    #[error("create claim {claim} for replica {replica}: {source}")]
    ClaimCreateFailed { replica: String, claim: String, source: StoreError },
    #[error("update claim {claim} for replica {replica}: {source}")]
    ClaimUpdateFailed { replica: String, claim: String, source: StoreError },
    #[error("create replica {replica}: {source}")]
    ReplicaCreateFailed { replica: String, source: StoreError },
    #[error("update replica {replica}: {source}")]
    ReplicaUpdateFailed { replica: String, source: StoreError },
    #[error("delete replica {replica}: {source}")]
    ReplicaDeleteFailed { replica: String, source: StoreError },
    #[error("retention decision for replica {replica}: {source}")]
    RetentionDecision { replica: String, source: StoreError },
    #[error("replica name {0:?} carries no ordinal")]
    InvalidReplicaName(String),
}

impl ControlError {
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ControlError::ClaimCreateFailed { source, .. }
            | ControlError::ClaimUpdateFailed { source, .. }
            | ControlError::ReplicaCreateFailed { source, .. }
            | ControlError::ReplicaUpdateFailed { source, .. }
            | ControlError::ReplicaDeleteFailed { source, .. }
            | ControlError::RetentionDecision { source, .. } => Some(source),
            ControlError::ClaimTerminating { .. } | ControlError::InvalidReplicaName(_) => None,
        }
    }

    pub fn is_already_exists(&self) -> bool { self.store_error().map_or(false, StoreError::is_already_exists) }
    pub fn is_conflict(&self) -> bool { self.store_error().map_or(false, StoreError::is_conflict) }
    pub fn is_cancelled(&self) -> bool { self.store_error().map_or(false, StoreError::is_cancelled) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordset_core::ObjectKind;

    #[test]
    fn helpers_look_through_the_source() {
        let e = ControlError::ReplicaCreateFailed {
            replica: "foo-0".into(),
            source: StoreError::AlreadyExists { kind: ObjectKind::Replica, name: "foo-0".into() },
        };
        assert!(e.is_already_exists());
        assert!(!e.is_conflict());
        assert_eq!(e.to_string(), "create replica foo-0: Pod foo-0 already exists");

        let e = ControlError::ReplicaUpdateFailed { replica: "foo-0".into(), source: StoreError::conflict(ObjectKind::Replica, "foo-0") };
        assert!(e.is_conflict());

        let e = ControlError::ClaimTerminating { replica: "foo-0".into(), claim: "datadir-foo-0".into() };
        assert!(e.store_error().is_none());
        assert!(!e.is_cancelled());
    }
}
