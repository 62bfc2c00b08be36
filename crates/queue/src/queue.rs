use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

/// Upper bound on how far ahead a delayed add may be scheduled.
const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Handle to a shared work queue. Clones refer to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    /// Signalled when an item is queued, and on shutdown.
    ready: Notify,
    /// Signalled when the processing set becomes empty.
    drained: Notify,
    limiter: Mutex<Box<dyn RateLimiter<T>>>,
    delay_tx: mpsc::UnboundedSender<(T, Instant)>,
    shutdown: CancellationToken,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing: everything in `queue`, plus processing
    /// items that were added again while in flight.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    queued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    shutting_down: bool,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            queued_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            shutting_down: false,
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Create a queue using the default controller rate limiter.
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    /// Must be called from within a Tokio runtime (spawns the delay loop).
    pub fn with_rate_limiter(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            name: name.into(),
            state: Mutex::new(State::new()),
            ready: Notify::new(),
            drained: Notify::new(),
            limiter: Mutex::new(Box::new(limiter)),
            delay_tx,
            shutdown: shutdown.clone(),
        });
        tokio::spawn(run_delay_loop(Arc::downgrade(&inner), delay_rx, shutdown));
        Self { inner }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Queue `item` unless it is already queued. If it is being processed it
    /// is queued again once the current worker calls [`WorkQueue::done`].
    pub fn add(&self, item: T) { self.inner.add(item) }

    /// Queue `item` after `delay`. While waiting, repeated calls keep the
    /// earliest deadline.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now);
        let _ = self.inner.delay_tx.send((item, ready_at));
    }

    /// Queue `item` after the rate limiter's backoff for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.lock_limiter().when(&item);
        counter!("workqueue_retries_total", 1, "name" => self.inner.name.clone());
        debug!(queue = %self.inner.name, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(item, delay);
    }

    /// Reset backoff for `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) { self.inner.lock_limiter().forget(item) }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.lock_limiter().num_requeues(item) }

    /// Wait for the next item and mark it processing. `None` once the queue
    /// is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            {
                let mut st = self.inner.lock_state();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.processing.insert(item.clone());
                    st.dirty.remove(&item);
                    if let Some(at) = st.queued_at.remove(&item) {
                        histogram!("workqueue_queue_latency_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.inner.name.clone());
                    }
                    st.started_at.insert(item.clone(), Instant::now());
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
                    return Some(item);
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Mark `item` no longer processing; requeue it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.inner.lock_state();
        st.processing.remove(item);
        if let Some(at) = st.started_at.remove(item) {
            histogram!("workqueue_work_duration_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.inner.name.clone());
        }
        let requeue = st.dirty.contains(item) && !st.shutting_down;
        if requeue {
            st.queued_at.insert(item.clone(), Instant::now());
            st.queue.push_back(item.clone());
        }
        let drained = st.processing.is_empty();
        drop(st);
        if requeue {
            self.inner.ready.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of items waiting to be handed out (excludes delayed items).
    pub fn len(&self) -> usize { self.inner.lock_state().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock_state().shutting_down }

    /// Stop accepting items and release every waiting `get` with `None`.
    /// Items already handed out may still be completed with `done`.
    pub fn shut_down(&self) {
        {
            let mut st = self.inner.lock_state();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        info!(queue = %self.inner.name, "work queue shutting down");
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
    }

    /// Like [`WorkQueue::shut_down`], then wait until every in-flight item is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            {
                let st = self.inner.lock_state();
                if st.processing.is_empty() {
                    return;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }
}

impl<T> Inner<T>
where
    T: Hash + Eq + Clone,
{
    fn lock_state(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn lock_limiter(&self) -> MutexGuard<'_, Box<dyn RateLimiter<T>>> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, item: T) {
        let mut st = self.lock_state();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        counter!("workqueue_adds_total", 1, "name" => self.name.clone());
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            return;
        }
        st.queued_at.insert(item.clone(), Instant::now());
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
        drop(st);
        self.ready.notify_one();
    }
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<T> Eq for Waiting<T> {}

// Reversed so the BinaryHeap pops the earliest deadline first.
impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

/// Holds delayed items until their deadline, then adds them to the queue.
/// Exits on shutdown or once every queue handle is dropped.
async fn run_delay_loop<T>(
    inner: Weak<Inner<T>>,
    mut rx: mpsc::UnboundedReceiver<(T, Instant)>,
    shutdown: CancellationToken,
) where
    T: Hash + Eq + Clone,
{
    let mut heap: BinaryHeap<Waiting<T>> = BinaryHeap::new();
    // Latest accepted deadline per item; heap entries that disagree are stale.
    let mut waiting: FxHashMap<T, Instant> = FxHashMap::default();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = heap.pop() else { break };
            if waiting.get(&w.item) != Some(&w.ready_at) {
                continue;
            }
            waiting.remove(&w.item);
            match inner.upgrade() {
                Some(q) => q.add(w.item),
                None => return,
            }
        }

        let next = heap.peek().map(|w| w.ready_at);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            msg = rx.recv() => match msg {
                Some((item, ready_at)) => {
                    let earlier_pending = waiting.get(&item).is_some_and(|at| *at <= ready_at);
                    if !earlier_pending {
                        waiting.insert(item.clone(), ready_at);
                        seq = seq.wrapping_add(1);
                        heap.push(Waiting { ready_at, seq, item });
                    }
                }
                None => return,
            },
            _ = tokio::time::sleep_until(next.unwrap_or(now)), if next.is_some() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemExponentialRateLimiter;

    fn queue() -> WorkQueue<String> {
        WorkQueue::with_rate_limiter(
            "test",
            ItemExponentialRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        for _ in 0..5 {
            q.add("ns1/foo".to_string());
        }
        q.add("ns1/bar".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("ns1/foo"));
        assert_eq!(q.get().await.as_deref(), Some("ns1/bar"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_once_after_done() {
        let q = queue();
        q.add("k".to_string());
        let k = q.get().await.unwrap();
        q.add("k".to_string());
        q.add("k".to_string());
        assert_eq!(q.len(), 0, "processing item must not be handed out again");
        q.done(&k);
        assert_eq!(q.len(), 1);
        let k2 = q.get().await.unwrap();
        q.done(&k2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("k".to_string());
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_getters() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        q.shut_down();
        for w in waiters {
            assert_eq!(w.await.unwrap(), None);
        }
        q.add("late".to_string());
        assert!(q.is_empty(), "adds after shutdown are ignored");
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = queue();
        q.add_after("k".to_string(), Duration::from_millis(50));
        assert!(q.is_empty());
        let started = Instant::now();
        let k = q.get().await.unwrap();
        assert_eq!(k, "k");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("k".to_string(), Duration::from_millis(100));
        q.add_after("k".to_string(), Duration::from_millis(20));
        q.add_after("k".to_string(), Duration::from_millis(500));
        let started = Instant::now();
        q.get().await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(20) && waited < Duration::from_millis(100), "waited {waited:?}");
        q.done(&"k".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(q.is_empty(), "stale deadlines must not re-add the item");
    }

    #[tokio::test(start_paused = true)]
    async fn huge_backoff_is_clamped_instead_of_overflowing() {
        let q: WorkQueue<String> = WorkQueue::with_rate_limiter(
            "huge",
            ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(u64::MAX)),
        );
        for _ in 0..40 {
            q.add_rate_limited("k".to_string());
        }
        q.add_after("k".to_string(), Duration::MAX);
        assert_eq!(q.num_requeues(&"k".to_string()), 40);
        assert!(q.is_empty());
        // Earliest deadline (5ms) still wins over the clamped ones.
        let started = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("k"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight_items() {
        let q = queue();
        q.add("k".to_string());
        let k = q.get().await.unwrap();
        let drain = tokio::spawn({
            let q = q.clone();
            async move { q.shut_down_with_drain().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drain.is_finished());
        q.done(&k);
        drain.await.unwrap();
        assert!(q.is_shutting_down());
    }
}
