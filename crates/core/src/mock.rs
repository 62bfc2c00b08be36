//! In-memory collaborators for tests and local runs.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use kube::Resource;

use crate::{ClientError, EventKind, EventRecorder, ObjectKey, StatusClient};

/// Records every status write; failures can be scripted ahead of time.
pub struct MockStatusClient<K> {
    writes: Mutex<Vec<K>>,
    failures: Mutex<VecDeque<ClientError>>,
}

impl<K> Default for MockStatusClient<K> {
    fn default() -> Self { Self { writes: Mutex::new(Vec::new()), failures: Mutex::new(VecDeque::new()) } }
}

impl<K: Clone> MockStatusClient<K> {
    pub fn new() -> Self { Self::default() }

    /// Next write attempt fails with `err` (queued, one per call).
    pub fn fail_next(&self, err: ClientError) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).push_back(err);
    }

    pub fn writes(&self) -> Vec<K> { self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn write_count(&self) -> usize { self.writes.lock().unwrap_or_else(PoisonError::into_inner).len() }
}

#[async_trait::async_trait]
impl<K: Clone + Send + Sync> StatusClient<K> for MockStatusClient<K> {
    async fn update_status(&self, obj: &K) -> Result<K, ClientError> {
        if let Some(err) = self.failures.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            return Err(err);
        }
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).push(obj.clone());
        Ok(obj.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct MockEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MockEventRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> { self.events.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn reasons(&self) -> Vec<String> { self.events().into_iter().map(|e| e.reason).collect() }
}

#[async_trait::async_trait]
impl<K: Resource + Send + Sync> EventRecorder<K> for MockEventRecorder {
    async fn record(&self, obj: &K, kind: EventKind, reason: &str, message: &str) -> Result<(), ClientError> {
        let key = ObjectKey::for_object(obj).map(|k| k.to_string()).unwrap_or_default();
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedEvent {
            key,
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
