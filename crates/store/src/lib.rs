//! Keel store: in-RAM cached view of one resource kind, fed by a watcher
//! through an ingest loop, with add/update/delete fan-out to subscribers.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use keel_core::{CacheError, EventHandler, ObjectCache, ObjectKey};
use kube::Resource;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Change notifications produced by a list+watch source.
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    Applied(K),
    Deleted(K),
    /// Full relist; replaces the cache content and marks it synced.
    Restarted(Vec<K>),
}

type Handlers<K> = Vec<Arc<dyn EventHandler<K>>>;

/// Process-local view of objects keyed by `namespace/name`.
///
/// Objects are shared as `Arc<K>` and never mutated in place; callers that
/// want to write must clone first.
pub struct Cache<K> {
    items: RwLock<FxHashMap<ObjectKey, Arc<K>>>,
    handlers: ArcSwap<Handlers<K>>,
    synced: watch::Sender<bool>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self { items: RwLock::new(FxHashMap::default()), handlers: ArcSwap::from_pointee(Vec::new()), synced }
    }
}

impl<K> Cache<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn list(&self) -> Vec<Arc<K>> { self.read().values().cloned().collect() }

    /// Receiver that flips to `true` after the first full list.
    pub fn synced_rx(&self) -> watch::Receiver<bool> { self.synced.subscribe() }

    /// Insert or replace `obj`; fires `on_add` or `on_update`.
    pub fn apply(&self, obj: K) {
        let Some(key) = key_of(&obj) else { return };
        let new = Arc::new(obj);
        let old = {
            let mut items = self.write();
            let old = items.insert(key, Arc::clone(&new));
            gauge!("cache_objects", items.len() as f64);
            old
        };
        counter!("cache_events_total", 1, "kind" => "applied");
        let handlers = self.handlers.load();
        for h in handlers.iter() {
            match &old {
                Some(old) => h.on_update(old, &new),
                None => h.on_add(&new),
            }
        }
    }

    /// Remove `obj` by key; fires `on_delete` with the last cached state.
    pub fn delete(&self, obj: &K) {
        let Some(key) = key_of(obj) else { return };
        let removed = {
            let mut items = self.write();
            let removed = items.remove(&key);
            gauge!("cache_objects", items.len() as f64);
            removed
        };
        counter!("cache_events_total", 1, "kind" => "deleted");
        if let Some(gone) = removed {
            for h in self.handlers.load().iter() {
                h.on_delete(&gone);
            }
        }
    }

    /// Swap in a full list. Listed objects fire add/update, vanished ones
    /// fire delete. The cache counts as synced afterwards.
    pub fn replace(&self, list: Vec<K>) {
        let mut next: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        for obj in list {
            if let Some(key) = key_of(&obj) {
                next.insert(key, Arc::new(obj));
            }
        }
        let fresh = next.clone();
        let previous = {
            let mut items = self.write();
            gauge!("cache_objects", next.len() as f64);
            std::mem::replace(&mut *items, next)
        };
        counter!("cache_events_total", 1, "kind" => "restarted");
        let first_sync = !self.synced.send_replace(true);
        if first_sync {
            info!(count = fresh.len(), "cache synced");
        } else {
            debug!(count = fresh.len(), "cache relisted");
        }

        let handlers = self.handlers.load();
        for (key, new) in fresh.iter() {
            for h in handlers.iter() {
                match previous.get(key) {
                    Some(old) => h.on_update(old, new),
                    None => h.on_add(new),
                }
            }
        }
        for (key, gone) in previous.iter() {
            if fresh.contains_key(key) {
                continue;
            }
            for h in handlers.iter() {
                h.on_delete(gone);
            }
        }
    }

    /// Re-deliver every cached object as an update with old == new.
    pub fn resync(&self) {
        let snapshot = self.list();
        debug!(count = snapshot.len(), "cache resync");
        let handlers = self.handlers.load();
        for obj in snapshot.iter() {
            for h in handlers.iter() {
                h.on_update(obj, obj);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key_of<K: Resource>(obj: &K) -> Option<ObjectKey> {
    match ObjectKey::for_object(obj) {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(error = %e, "dropping object without a usable key");
            None
        }
    }
}

impl<K> ObjectCache<K> for Cache<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, CacheError> {
        Ok(self.read().get(&ObjectKey::new(namespace, name)).cloned())
    }

    fn has_synced(&self) -> bool { *self.synced.borrow() }

    fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&handler));
            next
        });
        for obj in self.list() {
            handler.on_add(&obj);
        }
    }
}

/// Spawn an ingest loop applying events to `cache`. When `resync` is set,
/// every cached object is re-delivered on that period. Returns a sender for
/// events; the loop exits once every sender is dropped.
pub fn spawn_ingest<K>(cache: Arc<Cache<K>>, cap: usize, resync: Option<Duration>) -> (mpsc::Sender<CacheEvent<K>>, JoinHandle<()>)
where
    K: Resource + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<CacheEvent<K>>(cap.max(1));
    let handle = tokio::spawn(async move {
        let period = resync.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(CacheEvent::Applied(o)) => cache.apply(o),
                    Some(CacheEvent::Deleted(o)) => cache.delete(&o),
                    Some(CacheEvent::Restarted(list)) => cache.replace(list),
                    None => {
                        debug!("cache event channel closed; exiting ingest loop");
                        break;
                    }
                },
                _ = ticker.tick(), if resync.is_some() => cache.resync(),
            }
        }
        info!("ingest loop stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{SampleResource, SampleResourceSpec};
    use std::sync::Mutex;

    fn sr(ns: &str, name: &str, spec: &str) -> SampleResource {
        let mut o = SampleResource::new(name, SampleResourceSpec { name: spec.into() });
        o.metadata.namespace = Some(ns.into());
        o
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl EventHandler<SampleResource> for Log {
        fn on_add(&self, obj: &SampleResource) {
            self.0.lock().unwrap().push(format!("add {}", ObjectKey::for_object(obj).unwrap()));
        }
        fn on_update(&self, _old: &SampleResource, new: &SampleResource) {
            self.0.lock().unwrap().push(format!("update {}", ObjectKey::for_object(new).unwrap()));
        }
        fn on_delete(&self, obj: &SampleResource) {
            self.0.lock().unwrap().push(format!("delete {}", ObjectKey::for_object(obj).unwrap()));
        }
    }

    #[test]
    fn apply_distinguishes_add_from_update() {
        let cache = Cache::new();
        let log = Arc::new(Log::default());
        cache.subscribe(log.clone());
        cache.apply(sr("ns1", "foo", "a"));
        cache.apply(sr("ns1", "foo", "b"));
        cache.delete(&sr("ns1", "foo", "b"));
        cache.delete(&sr("ns1", "foo", "b"));
        assert_eq!(*log.0.lock().unwrap(), vec!["add ns1/foo", "update ns1/foo", "delete ns1/foo"]);
    }

    #[test]
    fn get_returns_latest_and_none_when_missing() {
        let cache = Cache::new();
        cache.apply(sr("ns1", "foo", "a"));
        cache.apply(sr("ns1", "foo", "b"));
        let got = cache.get(Some("ns1"), "foo").unwrap().unwrap();
        assert_eq!(got.spec.name, "b");
        assert!(cache.get(Some("ns1"), "missing").unwrap().is_none());
        assert!(cache.get(Some("ns2"), "foo").unwrap().is_none());
    }

    #[test]
    fn replace_marks_synced_and_reports_changes() {
        let cache = Cache::new();
        cache.apply(sr("ns1", "keep", "a"));
        cache.apply(sr("ns1", "gone", "a"));
        let log = Arc::new(Log::default());
        cache.subscribe(log.clone());
        log.0.lock().unwrap().clear();
        assert!(!cache.has_synced());

        cache.replace(vec![sr("ns1", "keep", "b"), sr("ns1", "new", "a")]);
        assert!(cache.has_synced());
        assert_eq!(cache.len(), 2);
        let mut seen = log.0.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["add ns1/new", "delete ns1/gone", "update ns1/keep"]);
    }

    #[test]
    fn subscribe_replays_existing_objects() {
        let cache = Cache::new();
        cache.apply(sr("ns1", "a", "x"));
        cache.apply(sr("ns2", "b", "y"));
        let log = Arc::new(Log::default());
        cache.subscribe(log.clone());
        let mut seen = log.0.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["add ns1/a", "add ns2/b"]);
    }

    #[test]
    fn nameless_objects_are_dropped() {
        let cache = Cache::new();
        let mut o = sr("ns1", "x", "a");
        o.metadata.name = None;
        cache.apply(o);
        assert!(cache.is_empty());
    }
}
