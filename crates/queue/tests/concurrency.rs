#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_queue::{ItemExponentialRateLimiter, WorkQueue};
use tokio::time::Instant;

fn queue(name: &str) -> WorkQueue<String> {
    WorkQueue::with_rate_limiter(name, ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_millis(80)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_key_is_processed_by_two_workers_at_once() {
    let q = queue("inflight");
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(Mutex::new(0usize));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = q.clone();
        let in_flight = Arc::clone(&in_flight);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                assert!(in_flight.lock().unwrap().insert(key.clone()), "{key} handed out twice");
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.lock().unwrap().remove(&key);
                *processed.lock().unwrap() += 1;
                q.done(&key);
            }
        }));
    }

    // Hammer a handful of keys while workers drain them.
    for round in 0..50 {
        for k in 0..3 {
            q.add(format!("ns/obj-{k}"));
        }
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shut_down();
    for w in workers {
        w.await.unwrap();
    }
    let n = *processed.lock().unwrap();
    assert!(n >= 3, "every key must be processed at least once");
    assert!(n < 150, "bursts must coalesce (processed {n} times)");
}

#[tokio::test]
async fn burst_during_processing_yields_exactly_one_followup() {
    let q = queue("burst");
    q.add("ns1/foo".to_string());
    let key = q.get().await.unwrap();
    for _ in 0..100 {
        q.add("ns1/foo".to_string());
    }
    q.done(&key);

    let again = q.get().await.unwrap();
    assert_eq!(again, "ns1/foo");
    q.done(&again);
    assert!(q.is_empty());
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_back_off_longer_until_cap() {
    let q = queue("backoff");
    let key = "ns1/foo".to_string();
    let mut delays = Vec::new();
    for _ in 0..6 {
        let started = Instant::now();
        q.add_rate_limited(key.clone());
        let got = q.get().await.unwrap();
        delays.push(started.elapsed());
        q.done(&got);
    }
    for pair in delays.windows(2) {
        assert!(pair[1] >= pair[0], "delays must not shrink: {delays:?}");
    }
    assert!(delays[0] >= Duration::from_millis(5));
    assert!(delays[1] > delays[0]);
    assert!(*delays.last().unwrap() < Duration::from_millis(90), "capped: {delays:?}");
    assert_eq!(q.num_requeues(&key), 6);

    q.forget(&key);
    assert_eq!(q.num_requeues(&key), 0);
    let started = Instant::now();
    q.add_rate_limited(key.clone());
    q.get().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(10), "forget resets to the base delay");
}
