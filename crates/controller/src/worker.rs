use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use keel_core::ObjectKey;
use keel_queue::WorkQueue;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconcile::Reconciler;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Reconcile one dequeued key and settle it on the queue. Success resets the
/// key's backoff; an error or a panic requeues it rate-limited. `done` is
/// always called.
pub async fn process_item(queue: &WorkQueue<ObjectKey>, reconciler: &dyn Reconciler, key: ObjectKey) {
    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
    match result {
        Ok(Ok(outcome)) => {
            queue.forget(&key);
            counter!("reconcile_total", 1, "outcome" => outcome.label());
            info!(key = %key, outcome = outcome.label(), "successfully synced");
        }
        Ok(Err(e)) => {
            counter!("reconcile_errors_total", 1, "kind" => e.kind());
            warn!(key = %key, error = %e, requeues = queue.num_requeues(&key), "error syncing; requeuing");
            queue.add_rate_limited(key.clone());
        }
        Err(payload) => {
            counter!("reconcile_panics_total", 1);
            error!(key = %key, panic = %panic_message(payload.as_ref()), "reconcile panicked; requeuing");
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
    histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
}

/// Pull keys until the queue shuts down or `token` fires. Cancellation only
/// interrupts the wait for a key; an in-flight reconcile runs to completion.
pub async fn run_worker(id: usize, queue: WorkQueue<ObjectKey>, reconciler: Arc<dyn Reconciler>, token: CancellationToken) {
    debug!(worker = id, queue = queue.name(), "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            key = queue.get() => key,
        };
        let Some(key) = next else { break };
        process_item(&queue, reconciler.as_ref(), key).await;
    }
    debug!(worker = id, "worker stopped");
}
