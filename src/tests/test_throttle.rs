use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use tokio::time::Instant;

use super::stores::{AlwaysOvershootStore, CountingStore, FlakyStore, SlowReplyStore};
use crate::{
    CallError, CheckIntervalDivisor, CheckIntervalMs, ConcurrencyLimit, CounterKey,
    CounterStore, MemoryCounterStore, Throttle, ThrottleOptions, Window,
};

fn options(limit: u64, window: Window) -> ThrottleOptions {
    ThrottleOptions {
        key: CounterKey::try_from("test").unwrap(),
        limit: ConcurrencyLimit::try_from(limit).unwrap(),
        window,
        check_interval_divisor: CheckIntervalDivisor::default(),
        check_interval_ms: None,
    }
}

fn fixed(secs: f64) -> Window {
    Window::fixed_secs(secs).unwrap()
}

/// Tracks how many operations run at once and the highest value seen.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[test]
fn poll_interval_derives_from_window_and_divisor() {
    let mut opts = options(3, fixed(5.0));
    assert_eq!(opts.poll_interval(), Duration::from_millis(1250));

    opts.check_interval_divisor = CheckIntervalDivisor::try_from(10).unwrap();
    assert_eq!(opts.poll_interval(), Duration::from_millis(500));

    opts.check_interval_ms = Some(CheckIntervalMs::try_from(75).unwrap());
    assert_eq!(opts.poll_interval(), Duration::from_millis(75));

    let mut tiny = options(1, Window::fixed(Duration::from_millis(1)).unwrap());
    tiny.check_interval_divisor = CheckIntervalDivisor::try_from(1_000_000).unwrap();
    assert_eq!(tiny.poll_interval(), Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn ten_calls_at_limit_three_drain_in_four_to_five_seconds() {
    let store = Arc::new(MemoryCounterStore::new());
    let concurrency = Arc::new(Concurrency::default());

    let throttle = Throttle::new(store.clone(), options(3, fixed(5.0)));
    throttle.reset().await.unwrap();

    let throttled = throttle.clone().wrap({
        let concurrency = concurrency.clone();
        let throttle = throttle.clone();
        move |n: u64| {
            let concurrency = concurrency.clone();
            let throttle = throttle.clone();
            async move {
                concurrency.enter();
                tokio::time::sleep(Duration::from_millis(500)).await;
                let snapshot = (n, throttle.running_count(), throttle.waiting_count());
                concurrency.leave();
                Ok::<_, std::convert::Infallible>(snapshot)
            }
        }
    });

    let before = Instant::now();
    let results = join_all((1..=10).map(|n| throttled.call(n))).await;
    let elapsed = before.elapsed();

    assert!(elapsed > Duration::from_secs(4), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    assert_eq!(results.len(), 10);
    for (i, result) in results.into_iter().enumerate() {
        let (n, running, waiting) = result.unwrap();
        assert_eq!(n, i as u64 + 1);
        assert!(running <= 3, "call {n} saw running = {running}");
        assert!(waiting >= 1, "call {n} saw waiting = {waiting}");
    }

    assert_eq!(concurrency.peak(), 3);
    assert_eq!(throttled.running_store_count().await.unwrap(), 0);
    assert_eq!(throttled.running_count(), 0);
    assert_eq!(throttled.waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn independent_instances_share_one_bound() {
    let store = Arc::new(MemoryCounterStore::new());
    let concurrency = Arc::new(Concurrency::default());

    let mut opts = options(2, fixed(1.0));
    opts.check_interval_ms = Some(CheckIntervalMs::try_from(50).unwrap());

    // Three throttles with the same key, as if built in three processes.
    let instances: Vec<_> = (0..3)
        .map(|_| Throttle::new(store.clone(), opts.clone()))
        .collect();

    let calls = (0..12).map(|i| {
        let throttle = instances[i % instances.len()].clone();
        let concurrency = concurrency.clone();
        async move {
            throttle
                .run(|| async {
                    concurrency.enter();
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    concurrency.leave();
                    Ok::<_, std::convert::Infallible>(i)
                })
                .await
        }
    });

    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(concurrency.peak(), 2);
    assert_eq!(store.get(instances[0].key()).await.unwrap(), 0);
    for throttle in &instances {
        assert_eq!(throttle.waiting_count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn failing_operation_still_releases_its_slot() {
    let store = Arc::new(MemoryCounterStore::new());
    let throttle = Throttle::new(store.clone(), options(1, fixed(1.0)));

    let result = throttle
        .run(|| async { Err::<(), _>("boom") })
        .await;

    match result {
        Err(CallError::Operation(msg)) => assert_eq!(msg, "boom"),
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(throttle.running_store_count().await.unwrap(), 0);
    assert_eq!(throttle.waiting_count(), 0);

    // The slot is free again for the next caller.
    let ok = throttle
        .run(|| async { Ok::<_, &str>(1) })
        .await
        .unwrap();
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn store_failure_aborts_call_without_running_operation() {
    let store = Arc::new(FlakyStore::default());
    store.fail_reads.store(true, Ordering::SeqCst);

    let throttle = Throttle::new(store.clone(), options(2, fixed(1.0)));
    let ran = AtomicBool::new(false);

    let result = throttle
        .run(|| async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_store());
    assert!(err.into_operation().is_none());
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(throttle.waiting_count(), 0);
    // Never admitted, so nothing to give back.
    assert_eq!(store.value.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_release_does_not_replace_operation_result() {
    let store = Arc::new(FlakyStore::default());
    let throttle = Throttle::new(store.clone(), options(2, fixed(1.0)));

    let result = throttle
        .run(|| async {
            store.fail_decrements.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>("done")
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(throttle.waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn overshooting_claims_roll_back_and_never_admit() {
    let store = Arc::new(AlwaysOvershootStore::new(2));

    let mut opts = options(2, Window::self_expiring_secs(4.0).unwrap());
    opts.check_interval_ms = Some(CheckIntervalMs::try_from(1000).unwrap());
    let throttle = Throttle::new(store.clone(), opts);

    let ran = AtomicBool::new(false);

    let outcome = tokio::time::timeout(
        Duration::from_millis(10_500),
        throttle.run(|| async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        }),
    )
    .await;

    assert!(outcome.is_err(), "call should still be waiting");
    assert!(!ran.load(Ordering::SeqCst));

    let claims = store.claims.load(Ordering::SeqCst);
    assert_eq!(claims, 11);
    assert_eq!(store.rollbacks.load(Ordering::SeqCst), claims);

    // The abandoned call no longer counts as waiting.
    assert_eq!(throttle.waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_cached_count_is_refreshed_after_one_poll() {
    let store = Arc::new(CountingStore::default());

    let mut opts = options(3, fixed(1.0));
    opts.check_interval_ms = Some(CheckIntervalMs::try_from(100).unwrap());
    let throttle = Throttle::new(store.clone(), opts);

    for _ in 0..5 {
        store.inner.increment(throttle.key()).await.unwrap();
    }
    assert_eq!(throttle.running_store_count().await.unwrap(), 5);
    assert_eq!(throttle.running_count(), 5);

    // Capacity frees up behind this instance's back.
    store.inner.delete(throttle.key()).await.unwrap();
    let gets_before = store.gets();

    let before = Instant::now();
    throttle
        .run(|| async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap();

    // First attempt trusts the cache and backs off; the second one reads the store.
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
    assert_eq!(store.gets() - gets_before, 1);
    assert_eq!(throttle.running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn counter_at_limit_is_claimed_then_rolled_back() {
    let store = Arc::new(CountingStore::default());

    let mut opts = options(1, fixed(1.0));
    opts.check_interval_ms = Some(CheckIntervalMs::try_from(100).unwrap());
    let throttle = Throttle::new(store.clone(), opts);

    let permit = throttle.acquire().await.unwrap();
    assert_eq!(permit.claimed(), 1);

    let waiter = tokio::time::timeout(Duration::from_millis(50), throttle.acquire()).await;
    assert!(waiter.is_err());

    // One admitted claim, one overshooting claim that was rolled back.
    assert_eq!(store.increments(), 2);
    assert_eq!(store.decrements(), 1);
    assert_eq!(store.inner.get(throttle.key()).await.unwrap(), 1);

    assert_eq!(permit.release().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn released_permit_admits_a_waiter() {
    let store = Arc::new(MemoryCounterStore::new());

    let mut opts = options(2, fixed(1.0));
    opts.check_interval_ms = Some(CheckIntervalMs::try_from(100).unwrap());
    let throttle = Throttle::new(store.clone(), opts);

    let first = throttle.acquire().await.unwrap();
    let second = throttle.acquire().await.unwrap();
    assert_eq!(throttle.waiting_count(), 2);

    let third = tokio::spawn({
        let throttle = throttle.clone();
        async move { throttle.acquire().await.unwrap().release().await.unwrap() }
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!third.is_finished());
    assert_eq!(throttle.waiting_count(), 3);

    first.release().await.unwrap();

    assert_eq!(third.await.unwrap(), 1);
    second.release().await.unwrap();

    assert_eq!(store.get(throttle.key()).await.unwrap(), 0);
    assert_eq!(throttle.waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_call_returns_its_slot() {
    let store = Arc::new(MemoryCounterStore::new());
    let throttle = Throttle::new(store.clone(), options(1, fixed(1.0)));

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        throttle.run(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, std::io::Error>(())
        }),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(throttle.waiting_count(), 0);

    // Let the detached release run.
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(store.get(throttle.key()).await.unwrap(), 0);
    assert_eq!(throttle.running_count(), 0);
}

#[tokio::test]
async fn reset_deletes_counter_and_zeroes_tallies() {
    let store = Arc::new(MemoryCounterStore::new());
    let throttle = Throttle::new(store.clone(), options(3, fixed(1.0)));

    for _ in 0..4 {
        store.increment(throttle.key()).await.unwrap();
    }
    assert_eq!(throttle.running_store_count().await.unwrap(), 4);

    throttle.reset().await.unwrap();
    assert_eq!(throttle.running_count(), 0);
    assert_eq!(throttle.waiting_count(), 0);
    assert_eq!(throttle.running_store_count().await.unwrap(), 0);
    assert!(!store.contains(throttle.key()));

    throttle.reset().await.unwrap();
    assert_eq!(throttle.running_store_count().await.unwrap(), 0);
}

#[tokio::test]
async fn self_expiring_window_claims_with_ttl_and_expires_when_idle() {
    let store = Arc::new(CountingStore::default());
    let throttle = Throttle::new(
        store.clone(),
        options(2, Window::self_expiring(Duration::from_millis(60)).unwrap()),
    );

    throttle
        .run(|| async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap();

    assert_eq!(store.increments_with_expiry(), 1);
    assert_eq!(store.increments(), 0);
    // Released, but the key lingers until its ttl runs out.
    assert!(store.inner.contains(throttle.key()));

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!store.inner.contains(throttle.key()));
    assert_eq!(throttle.running_store_count().await.unwrap(), 0);
}

#[tokio::test]
async fn fixed_window_claims_never_set_a_ttl() {
    let store = Arc::new(CountingStore::default());
    let throttle = Throttle::new(store.clone(), options(2, fixed(0.05)));

    throttle
        .run(|| async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap();

    assert_eq!(store.increments(), 1);
    assert_eq!(store.increments_with_expiry(), 0);
}

#[tokio::test]
async fn throttled_call_passes_tuple_arguments() {
    let throttle = Throttle::new(MemoryCounterStore::new(), options(2, fixed(1.0)));
    let add = throttle.wrap(|(a, b): (i32, i32)| async move {
        if b == 0 {
            Err("zero")
        } else {
            Ok(a + b)
        }
    });

    assert_eq!(add.call((2, 3)).await.unwrap(), 5);
    assert_eq!(add.call((2, 0)).await.unwrap_err().into_operation(), Some("zero"));
    assert_eq!(add.waiting_count(), 0);
    assert_eq!(add.running_store_count().await.unwrap(), 0);

    add.reset().await.unwrap();
    assert_eq!(add.throttle().running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn call_dropped_while_claim_in_flight_returns_its_slot() {
    let store = Arc::new(SlowReplyStore::new(Duration::from_millis(20)));
    let throttle = Throttle::new(store.clone(), options(1, fixed(1.0)));

    // Dropped at 5ms; the increment lands at 20ms and answers at 40ms.
    let outcome = tokio::time::timeout(
        Duration::from_millis(5),
        throttle.run(|| async { Ok::<_, std::io::Error>(()) }),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(throttle.waiting_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.inner.get(throttle.key()).await.unwrap(), 0);

    let next = tokio::time::timeout(
        Duration::from_secs(30),
        throttle.run(|| async { Ok::<_, std::io::Error>(()) }),
    )
    .await;
    assert!(matches!(next, Ok(Ok(()))));
    assert_eq!(store.inner.get(throttle.key()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn call_dropped_while_overshoot_in_flight_still_rolls_back() {
    let store = Arc::new(SlowReplyStore::new(Duration::from_millis(20)));
    let throttle = Throttle::new(store.clone(), options(1, fixed(1.0)));

    // Another holder owns the only slot.
    store.inner.increment(throttle.key()).await.unwrap();

    // Dropped at 30ms, after the overshooting increment landed but before its reply.
    let outcome = tokio::time::timeout(
        Duration::from_millis(30),
        throttle.run(|| async { Ok::<_, std::io::Error>(()) }),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.inner.get(throttle.key()).await.unwrap(), 1);
}
