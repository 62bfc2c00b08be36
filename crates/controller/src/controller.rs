use std::sync::Arc;
use std::time::Duration;

use keel_core::{EventRecorder, ObjectCache, ObjectKey, SampleResource, StatusClient};
use keel_queue::WorkQueue;
use kube::Resource;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapter::EnqueueHandler;
use crate::config::{ConfigError, ControllerConfig};
use crate::reconcile::{Reconciler, SampleReconciler};
use crate::worker::run_worker;

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Owns the work queue and the worker pool for one resource kind.
pub struct Controller<K> {
    config: ControllerConfig,
    cache: Arc<dyn ObjectCache<K>>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller<SampleResource> {
    pub fn new(
        config: ControllerConfig,
        cache: Arc<dyn ObjectCache<SampleResource>>,
        client: Arc<dyn StatusClient<SampleResource>>,
        recorder: Arc<dyn EventRecorder<SampleResource>>,
    ) -> Self {
        let reconciler = Arc::new(SampleReconciler::new(Arc::clone(&cache), client, recorder));
        Self::with_reconciler(config, cache, reconciler)
    }
}

impl<K> Controller<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Build the queue and register the enqueue handler on `cache`.
    /// Must be called from within a Tokio runtime.
    pub fn with_reconciler(config: ControllerConfig, cache: Arc<dyn ObjectCache<K>>, reconciler: Arc<dyn Reconciler>) -> Self {
        let queue = WorkQueue::with_rate_limiter(config.controller_name.clone(), config.rate_limiter());
        cache.subscribe(Arc::new(EnqueueHandler::new(queue.clone())));
        Self { config, cache, queue, reconciler }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    /// Wait for the cache, start `workers` workers, then block until `token`
    /// is cancelled. On return the queue is shut down and every worker has
    /// finished its current item.
    pub async fn run(self, token: CancellationToken) -> Result<(), ControllerError> {
        if let Err(e) = self.config.validate() {
            self.queue.shut_down();
            return Err(e.into());
        }
        info!(controller = %self.config.controller_name, "starting controller");

        info!("waiting for informer caches to sync");
        if let Err(e) = self.wait_for_cache_sync(&token).await {
            self.queue.shut_down();
            return Err(e);
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(run_worker(id, self.queue.clone(), Arc::clone(&self.reconciler), token.clone()));
        }
        info!(workers = self.config.workers, "started workers");

        token.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down_with_drain().await;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self, token: &CancellationToken) -> Result<(), ControllerError> {
        let timeout = self.config.cache_sync_timeout();
        let poll = async {
            let mut ticker = tokio::time::interval(CACHE_SYNC_POLL);
            loop {
                ticker.tick().await;
                if self.cache.has_synced() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = token.cancelled() => Err(ControllerError::CacheSync("cancelled before caches synced".into())),
            res = tokio::time::timeout(timeout, poll) => {
                res.map_err(|_| ControllerError::CacheSync(format!("timed out after {}s", timeout.as_secs())))
            }
        }
    }
}
