//! Keel core types: the SampleResource kind, object keys, and the traits the
//! controller uses to reach its collaborators (cache, status writer, events).

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

mod key;
pub mod mock;

pub use key::ObjectKey;

/// Desired state of a SampleResource. Written by the author only.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[kube(
    group = "samplecontroller.keel.dev",
    version = "v1",
    kind = "SampleResource",
    plural = "sampleresources",
    namespaced,
    status = "SampleResourceStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
pub struct SampleResourceSpec {
    /// Copied verbatim into `status.name`.
    #[serde(default)]
    pub name: String,
}

/// Observed state of a SampleResource. Written by the controller only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleResourceStatus {
    #[serde(default)]
    pub name: String,
}

impl SampleResource {
    /// Reject specs the controller cannot act on until the author fixes them.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.spec.name.is_empty() {
            return Err(SpecError::MissingField("spec.name"));
        }
        Ok(())
    }

    /// Status is a pure function of spec: it mirrors `spec.name`.
    pub fn desired_status(&self) -> SampleResourceStatus {
        SampleResourceStatus { name: self.spec.name.clone() }
    }

    pub fn status_matches(&self, desired: &SampleResourceStatus) -> bool {
        self.status.as_ref() == Some(desired)
    }

    /// Copy of `self` carrying `status`; the original is left untouched.
    pub fn with_status(&self, status: SampleResourceStatus) -> Self {
        let mut copy = self.clone();
        copy.status = Some(status);
        copy
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("{0} must be specified")]
    MissingField(&'static str),
}

/// Lookup failures other than "not found" (which is `Ok(None)`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the data-store client. All of them are worth a retry.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Conflict(_) => "conflict",
            ClientError::NotFound(_) => "not_found",
            ClientError::Unavailable(_) => "unavailable",
            ClientError::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Callbacks fired by a cache when its content changes.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, _obj: &K) {}
}

/// Read side of the locally synced view of objects.
///
/// Implementations must be safe for concurrent readers and must never hand
/// out mutable access to cached objects.
pub trait ObjectCache<K>: Send + Sync {
    /// `Ok(None)` means the object is not (or no longer) present.
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, CacheError>;

    /// True once the initial full list has been stored.
    fn has_synced(&self) -> bool;

    /// Register `handler`; objects already cached are replayed as adds.
    fn subscribe(&self, handler: Arc<dyn EventHandler<K>>);
}

/// Writes the status subresource of an object.
#[async_trait::async_trait]
pub trait StatusClient<K: Send + Sync>: Send + Sync {
    async fn update_status(&self, obj: &K) -> Result<K, ClientError>;
}

/// Sink for audit events attached to an object.
#[async_trait::async_trait]
pub trait EventRecorder<K: Send + Sync>: Send + Sync {
    async fn record(&self, obj: &K, kind: EventKind, reason: &str, message: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(spec_name: &str) -> SampleResource {
        let mut sr = SampleResource::new("foo", SampleResourceSpec { name: spec_name.into() });
        sr.metadata.namespace = Some("ns1".into());
        sr
    }

    #[test]
    fn empty_spec_name_is_invalid() {
        assert_eq!(sample("").validate(), Err(SpecError::MissingField("spec.name")));
        assert!(sample("  ").validate().is_ok(), "only an empty name is rejected");
        assert!(sample("bar").validate().is_ok());
    }

    #[test]
    fn desired_status_mirrors_spec() {
        let sr = sample("bar");
        let desired = sr.desired_status();
        assert_eq!(desired.name, "bar");
        assert!(!sr.status_matches(&desired));

        let updated = sr.with_status(desired.clone());
        assert!(updated.status_matches(&desired));
        assert!(sr.status.is_none(), "with_status must not touch the original");
        assert_eq!(updated.spec, sr.spec);
    }

    #[test]
    fn status_serializes_under_status_key() {
        let sr = sample("bar").with_status(SampleResourceStatus { name: "bar".into() });
        let v = serde_json::to_value(&sr).unwrap();
        assert_eq!(v.pointer("/status/name").and_then(|v| v.as_str()), Some("bar"));
        assert_eq!(v.pointer("/spec/name").and_then(|v| v.as_str()), Some("bar"));
        assert_eq!(v.get("kind").and_then(|v| v.as_str()), Some("SampleResource"));
    }
}
