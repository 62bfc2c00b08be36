use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_core::{
    CacheError, ClientError, EventKind, EventRecorder, ObjectCache, ObjectKey, SampleResource, StatusClient,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

pub const REASON_SYNCED: &str = "Synced";
pub const MESSAGE_SYNCED: &str = "Sample synced successfully";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Why a key was dropped without a write. None of these improve on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MalformedKey,
    NotFound,
    InvalidSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Status was written.
    Synced,
    /// Status already matched spec; nothing written.
    Unchanged,
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Synced => "synced",
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Skipped(SkipReason::MalformedKey) => "malformed_key",
            SyncOutcome::Skipped(SkipReason::NotFound) => "not_found",
            SyncOutcome::Skipped(SkipReason::InvalidSpec) => "invalid_spec",
        }
    }
}

/// Transient failures; the key is requeued with backoff.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("cache lookup failed: {0}")]
    Lookup(#[from] CacheError),
    #[error("status update failed: {0}")]
    Write(#[from] ClientError),
}

impl ReconcileError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Lookup(_) => "lookup",
            ReconcileError::Write(e) => e.kind(),
        }
    }
}

/// Level-triggered sync of a single key. Must be safe to call repeatedly
/// and concurrently for different keys.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncOutcome, ReconcileError>;
}

/// Identifies one revision of an object's spec: `(uid, generation)`.
type SpecRevision = (Option<String>, Option<i64>);

fn spec_revision(obj: &SampleResource) -> SpecRevision { (obj.metadata.uid.clone(), obj.metadata.generation) }

/// Mirrors `spec.name` into `status.name`.
pub struct SampleReconciler {
    cache: Arc<dyn ObjectCache<SampleResource>>,
    client: Arc<dyn StatusClient<SampleResource>>,
    recorder: Arc<dyn EventRecorder<SampleResource>>,
    /// Keys whose current spec revision already got an `InvalidSpec` event.
    warned: Mutex<FxHashMap<ObjectKey, SpecRevision>>,
}

impl SampleReconciler {
    pub fn new(
        cache: Arc<dyn ObjectCache<SampleResource>>,
        client: Arc<dyn StatusClient<SampleResource>>,
        recorder: Arc<dyn EventRecorder<SampleResource>>,
    ) -> Self {
        Self { cache, client, recorder, warned: Mutex::new(FxHashMap::default()) }
    }

    fn warned(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, SpecRevision>> {
        self.warned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True the first time a given spec revision of `key` is seen invalid.
    fn first_warning(&self, key: &ObjectKey, revision: SpecRevision) -> bool {
        let mut warned = self.warned();
        if warned.get(key) == Some(&revision) {
            return false;
        }
        warned.insert(key.clone(), revision);
        true
    }

    /// Audit events are best effort; a failed record never fails the sync.
    async fn emit(&self, obj: &SampleResource, kind: EventKind, reason: &str, message: &str) {
        if let Err(e) = self.recorder.record(obj, kind, reason, message).await {
            warn!(reason, error = %e, "failed to record event");
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for SampleReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncOutcome, ReconcileError> {
        let (namespace, name) = match key.split() {
            Ok(parts) => parts,
            Err(e) => {
                warn!(key = %key, error = %e, "invalid resource key");
                return Ok(SyncOutcome::Skipped(SkipReason::MalformedKey));
            }
        };

        let Some(current) = self.cache.get(namespace, name)? else {
            info!(key = %key, "sample resource in work queue no longer exists");
            self.warned().remove(key);
            return Ok(SyncOutcome::Skipped(SkipReason::NotFound));
        };

        if let Err(e) = current.validate() {
            warn!(key = %key, error = %e, "invalid spec; waiting for an update");
            // Resyncs of the same revision stay silent.
            if self.first_warning(key, spec_revision(&current)) {
                self.emit(&current, EventKind::Warning, REASON_INVALID_SPEC, &format!("{}: {}", key, e)).await;
            }
            return Ok(SyncOutcome::Skipped(SkipReason::InvalidSpec));
        }
        self.warned().remove(key);

        let desired = current.desired_status();
        if current.status_matches(&desired) {
            debug!(key = %key, "status already up to date");
            return Ok(SyncOutcome::Unchanged);
        }

        // The cached object is shared with other workers; write a copy.
        let updated = current.with_status(desired);
        self.client.update_status(&updated).await?;
        self.emit(&current, EventKind::Normal, REASON_SYNCED, MESSAGE_SYNCED).await;
        Ok(SyncOutcome::Synced)
    }
}
