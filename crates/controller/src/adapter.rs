use keel_core::{EventHandler, ObjectKey};
use keel_queue::WorkQueue;
use kube::Resource;
use tracing::{trace, warn};

/// Cache callbacks -> work queue keys. Updates are not diffed; deciding
/// whether anything changed is left to the reconciler.
pub struct EnqueueHandler {
    queue: WorkQueue<ObjectKey>,
}

impl EnqueueHandler {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self { Self { queue } }

    fn enqueue<K: Resource>(&self, obj: &K) {
        match ObjectKey::for_object(obj) {
            Ok(key) => {
                trace!(key = %key, "enqueue");
                self.queue.add(key);
            }
            Err(e) => warn!(error = %e, "dropping notification: cannot derive key"),
        }
    }
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) { self.enqueue(obj) }

    fn on_update(&self, _old: &K, new: &K) { self.enqueue(new) }
}
