//! Lock manager behavior against the in-memory store.
//!
//! Virtual time (`start_paused`) keeps the timeout and TTL tests instant and
//! deterministic; the instrumented store's event log backs the
//! mutual-exclusion assertions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use exclave_lock::{LockConfig, LockError, LockManager};
use exclave_store::KeyValueStore;
use exclave_store_memory::{MemoryStore, StoreEvent};
use tokio::time::Instant;

fn manager_on(store: &MemoryStore) -> Arc<LockManager> {
    Arc::new(LockManager::new(
        Arc::new(store.clone()),
        LockConfig::default(),
    ))
}

/// Release channel for a key under the default config.
fn channel(key: &str) -> String {
    format!("{}:{}", LockConfig::default().channel_prefix, key)
}

#[tokio::test]
async fn acquire_uncontested() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    assert!(manager.acquire("job", Duration::from_secs(1)).await.unwrap());
    assert_eq!(store.get("job").as_deref(), Some("1"));

    manager.release("job").await.unwrap();
    assert!(store.get("job").is_none());
}

#[tokio::test]
async fn zero_timeout_tries_once() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    assert!(manager.acquire("job", Duration::ZERO).await.unwrap());
    assert!(
        !manager.acquire("job", Duration::ZERO).await.unwrap(),
        "held key should fail immediately with a zero timeout"
    );

    let events = store.events().await;
    assert_eq!(
        events,
        vec![
            StoreEvent::Acquired("job".to_owned()),
            StoreEvent::Contended("job".to_owned()),
        ],
        "a zero timeout must not retry"
    );
}

#[tokio::test]
async fn empty_key_is_rejected() {
    let manager = manager_on(&MemoryStore::new());

    let acquire = manager.acquire("", Duration::from_secs(1)).await;
    assert!(matches!(acquire, Err(LockError::EmptyKey)));

    let release = manager.release("").await;
    assert!(matches!(release, Err(LockError::EmptyKey)));
}

#[tokio::test]
async fn release_is_idempotent() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    manager.release("never-held").await.unwrap();

    assert!(manager.acquire("job", Duration::ZERO).await.unwrap());
    manager.release("job").await.unwrap();
    manager.release("job").await.unwrap();

    let deletes = store
        .events()
        .await
        .iter()
        .filter(|e| matches!(e, StoreEvent::Deleted(k) if k == "job"))
        .count();
    assert_eq!(deletes, 1, "only the first release deletes anything");
}

#[tokio::test(start_paused = true)]
async fn contended_acquire_times_out() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("busy", Duration::ZERO).await.unwrap());

    let started = Instant::now();
    let acquired = manager.acquire("busy", Duration::from_secs(2)).await.unwrap();
    assert!(!acquired);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "the full timeout should elapse before giving up"
    );
    assert_eq!(manager.waiting_keys().await, 0);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn release_wakes_waiter_before_its_timeout() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("shared", Duration::ZERO).await.unwrap());

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let started = Instant::now();
            let acquired = manager
                .acquire("shared", Duration::from_secs(60))
                .await
                .unwrap();
            (acquired, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.release("shared").await.unwrap();

    let (acquired, waited) = waiter.await.unwrap();
    assert!(acquired);
    assert!(
        waited < Duration::from_secs(1),
        "waiter should wake on the release notification, not its timeout; waited {waited:?}"
    );

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn woken_losers_repark_until_their_turn() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("slot", Duration::ZERO).await.unwrap());

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        waiters.push(tokio::spawn(async move {
            let acquired = manager.acquire("slot", Duration::from_secs(60)).await.unwrap();
            assert!(acquired);
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.release("slot").await.unwrap();
        }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.release("slot").await.unwrap();

    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_acquires_alternate_with_deletes(&store, "slot").await;
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_follows_first_and_last_waiter() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("res", Duration::ZERO).await.unwrap());

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("res", Duration::from_secs(60)).await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.subscribe_count(&channel("res")).await, 1);
    assert_eq!(manager.waiting_keys().await, 1);

    manager.release("res").await.unwrap();
    assert!(waiter.await.unwrap());

    assert_eq!(store.subscribe_count(&channel("res")).await, 1);
    assert_eq!(store.unsubscribe_count(&channel("res")).await, 1);
    assert_eq!(manager.waiting_keys().await, 0);

    manager.stop().await;
}

#[tokio::test]
async fn store_failure_propagates_to_callers() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    assert!(manager.acquire("job", Duration::ZERO).await.unwrap());
    store.fail_commands(true);

    // "Lock unknown" must never be masked as "lock not held".
    let acquire = manager.acquire("other", Duration::from_secs(1)).await;
    assert!(matches!(acquire, Err(LockError::StoreUnavailable(_))));

    let release = manager.release("job").await;
    assert!(matches!(release, Err(LockError::StoreUnavailable(_))));
    assert_eq!(store.get("job").as_deref(), Some("1"), "failed release deletes nothing");

    store.fail_commands(false);
    manager.release("job").await.unwrap();
    assert!(manager.acquire("job", Duration::ZERO).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn many_waiters_share_one_subscription() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("res", Duration::ZERO).await.unwrap());

    let mut waiters = Vec::new();
    for i in 0..3u64 {
        let manager = Arc::clone(&manager);
        waiters.push(tokio::spawn(async move {
            // Staggered deadlines keep the drain order deterministic.
            tokio::time::sleep(Duration::from_millis(10 * i)).await;
            manager.acquire("res", Duration::from_secs(1)).await.unwrap()
        }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.waiting_keys().await, 1);
    assert_eq!(
        store.subscribe_count(&channel("res")).await,
        1,
        "only the first waiter subscribes"
    );

    // The holder never releases; every waiter drains at its own deadline.
    for waiter in waiters {
        assert!(!waiter.await.unwrap());
    }

    assert_eq!(store.subscribe_count(&channel("res")).await, 1);
    assert_eq!(
        store.unsubscribe_count(&channel("res")).await,
        1,
        "only the last waiter unsubscribes"
    );
    assert_eq!(manager.waiting_keys().await, 0);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transport_failure_wakes_every_waiter() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("a", Duration::ZERO).await.unwrap());
    assert!(manager.acquire("b", Duration::ZERO).await.unwrap());

    let mut waiters = Vec::new();
    for key in ["a", "b"] {
        let manager = Arc::clone(&manager);
        waiters.push(tokio::spawn(async move {
            let started = Instant::now();
            let acquired = manager.acquire(key, Duration::from_secs(60)).await.unwrap();
            (acquired, started.elapsed())
        }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.waiting_keys().await, 2);

    // Free both keys without publishing, then kill the subscriber
    // connection. The reset broadcast is the only wake-up left.
    store.delete("a").await.unwrap();
    store.delete("b").await.unwrap();
    store.drop_subscribers().await;

    for waiter in waiters {
        let (acquired, waited) = waiter.await.unwrap();
        assert!(acquired);
        assert!(
            waited < Duration::from_secs(1),
            "waiter should wake on the reset broadcast, not its timeout; waited {waited:?}"
        );
    }

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_after_transport_failure_reopens_subscriber() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();
    assert_eq!(store.open_subscribers().await, 1);

    store.drop_subscribers().await;
    // Let the reader observe the stream end and exit.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.open_subscribers().await, 0);

    // No stop() in between: start must reap the dead reader itself.
    manager.start().await.unwrap();
    assert_eq!(
        store.open_subscribers().await,
        1,
        "a fresh start should open a new subscriber connection"
    );

    assert!(manager.acquire("key", Duration::ZERO).await.unwrap());
    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let started = Instant::now();
            let acquired = manager.acquire("key", Duration::from_secs(60)).await.unwrap();
            (acquired, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.release("key").await.unwrap();

    let (acquired, waited) = waiter.await.unwrap();
    assert!(acquired);
    assert!(
        waited < Duration::from_secs(1),
        "the new connection should deliver wake-ups; waited {waited:?}"
    );

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn without_reader_waiters_fall_back_to_timeout() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    assert!(manager.acquire("dark", Duration::ZERO).await.unwrap());

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("dark", Duration::from_secs(3)).await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The release still publishes, but nothing is listening.
    manager.release("dark").await.unwrap();
    assert!(manager.acquire("dark", Duration::ZERO).await.unwrap());

    assert!(
        !waiter.await.unwrap(),
        "with the key re-taken the waiter only retries at its deadline and loses"
    );
    assert_eq!(store.subscribe_count(&channel("dark")).await, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_lock_is_acquirable() {
    let store = MemoryStore::new();
    let config = LockConfig {
        lock_ttl: Duration::from_secs(2),
        ..LockConfig::default()
    };
    let manager = Arc::new(LockManager::new(Arc::new(store.clone()), config));

    assert!(manager.acquire("crashed", Duration::ZERO).await.unwrap());
    // Holder never releases; the TTL is the only recovery.
    assert!(!manager.acquire("crashed", Duration::ZERO).await.unwrap());

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(manager.acquire("crashed", Duration::ZERO).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_leaves_no_registration() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    assert!(manager.acquire("held", Duration::ZERO).await.unwrap());

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("held", Duration::from_secs(60)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.waiting_keys().await, 1);

    waiter.abort();
    assert!(waiter.await.is_err());
    // The drop guard finishes the bookkeeping on its own task.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(manager.waiting_keys().await, 0);
    assert_eq!(store.unsubscribe_count(&channel("held")).await, 1);

    manager.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);

    manager.stop().await;

    manager.start().await.unwrap();
    manager.start().await.unwrap();
    assert_eq!(
        store.open_subscribers().await,
        1,
        "a second start must not open another subscriber connection"
    );

    manager.stop().await;
    manager.stop().await;

    // A fresh start opens a fresh connection and locking still works.
    manager.start().await.unwrap();
    assert!(manager.acquire("again", Duration::ZERO).await.unwrap());
    manager.release("again").await.unwrap();
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lock_handle_round_trip() {
    let store = MemoryStore::new();
    let config = LockConfig {
        lock_ttl: Duration::from_secs(10),
        ..LockConfig::default()
    };
    let manager = Arc::new(LockManager::new(Arc::new(store.clone()), config));

    let handle = manager
        .lock("handle", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("uncontested lock");
    assert_eq!(handle.key(), "handle");
    assert_eq!(handle.ttl(), Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(4)).await;
    let remaining = handle.remaining();
    assert!(remaining <= Duration::from_secs(6), "remaining {remaining:?}");

    manager.unlock(handle).await.unwrap();
    assert!(store.get("handle").is_none());

    let second = manager.lock("handle", Duration::ZERO).await.unwrap();
    assert!(second.is_some());
}

#[tokio::test(start_paused = true)]
async fn contended_workers_never_overlap() {
    let store = MemoryStore::new();
    let manager = manager_on(&store);
    manager.start().await.unwrap();

    let in_section = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let in_section = Arc::clone(&in_section);
        workers.push(tokio::spawn(async move {
            for _ in 0..5 {
                assert!(
                    manager.acquire("mutex", Duration::from_secs(300)).await.unwrap(),
                    "worker should acquire well within its timeout"
                );
                assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0, "overlap");
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(in_section.fetch_sub(1, Ordering::SeqCst), 1, "overlap");
                manager.release("mutex").await.unwrap();
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }

    assert_acquires_alternate_with_deletes(&store, "mutex").await;
    assert_eq!(manager.waiting_keys().await, 0);
    manager.stop().await;
}

/// Walk the store's event log and require every successful conditional set
/// on `key` to be separated from the next by a delete.
async fn assert_acquires_alternate_with_deletes(store: &MemoryStore, key: &str) {
    let mut held = false;
    for event in store.events().await {
        match event {
            StoreEvent::Acquired(k) if k == key => {
                assert!(!held, "two acquisitions of {key:?} without a release between");
                held = true;
            }
            StoreEvent::Deleted(k) if k == key => held = false,
            _ => {}
        }
    }
}
