//! Integration tests implementing the six end-to-end scenarios of §8,
//! exercised against the public `StorageEngine` surface the way
//! `kv-cli/tests/*.rs` exercises `kvcli`'s public surface: plain
//! `#[tokio::test]` functions, one scenario per test, against a real
//! (in-memory) backing store rather than mocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use objstore::engine::{ObjectKey, StorageEngine};
use objstore::storage::memory::MemoryStorage;
use objstore::storage::{ListOptions, Status, Storage, StoredEntry};
use objstore::{CResult, Error};

fn engine() -> StorageEngine<MemoryStorage> {
    StorageEngine::new(ObjectKey::from("scenario"), MemoryStorage::new(), true)
}

fn int(n: i64) -> Vec<u8> {
    n.to_string().into_bytes()
}

fn parse(bytes: &[u8]) -> i64 {
    std::str::from_utf8(bytes).unwrap().parse().unwrap()
}

/// A `Storage` wrapper counting batch calls reaching the backing store,
/// used to observe write-coalescing (P7) from outside the engine.
struct CountingStorage<S> {
    inner: S,
    put_many_calls: Arc<AtomicUsize>,
    delete_many_calls: Arc<AtomicUsize>,
}

impl<S: Storage> Storage for CountingStorage<S> {
    fn get(&mut self, key: &[u8]) -> CResult<Option<StoredEntry>> {
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], entry: StoredEntry) -> CResult<()> {
        self.inner.put(key, entry)
    }

    fn put_many(&mut self, pairs: Vec<(Vec<u8>, StoredEntry)>) -> CResult<()> {
        self.put_many_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.put_many(pairs)
    }

    fn delete(&mut self, key: &[u8]) -> CResult<bool> {
        self.inner.delete(key)
    }

    fn delete_many(&mut self, keys: &[Vec<u8>]) -> CResult<usize> {
        self.delete_many_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_many(keys)
    }

    fn list(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        self.inner.list(opts)
    }

    fn status(&mut self) -> CResult<Status> {
        self.inner.status()
    }
}

/// Scenario 1: basic put/get/delete.
#[tokio::test]
async fn basic_put_get_delete() -> CResult<()> {
    let engine = engine();
    engine.put(b"k", b"v".to_vec()).await?;
    assert_eq!(engine.get(b"k").await?, Some(b"v".to_vec()));
    assert!(engine.delete(b"k").await?);
    assert_eq!(engine.get(b"k").await?, None);
    Ok(())
}

/// Scenario 2: a transaction that reads `k`, yields to a concurrent
/// direct write, then writes `k = read + 1` must retry exactly once and
/// settle on the value that reflects the interleaved write.
#[tokio::test]
async fn transaction_conflict_retry() -> CResult<()> {
    let engine = engine();
    engine.put(b"k", int(1)).await?;

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_inner = attempts.clone();
    let engine_for_closure = engine.clone();

    let result = engine
        .transaction(move |tx| {
            let attempts = attempts_inner.clone();
            let engine_for_closure = engine_for_closure.clone();
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let current = parse(&tx.get(b"k").await?.unwrap());
                if attempt == 0 {
                    // Lands a conflicting direct write between this
                    // attempt's read and its commit, forcing a retry.
                    engine_for_closure.put(b"k", int(2)).await?;
                }
                tx.put(b"k", int(current + 1)).await?;
                Ok::<(), Error>(())
            })
        })
        .await;

    result?;
    assert_eq!(attempts.load(Ordering::SeqCst), 2, "expected exactly one retry");
    assert_eq!(engine.get(b"k").await?, Some(int(3)));
    Ok(())
}

/// Scenario 3: `list` with `startAfter` and `limit`.
#[tokio::test]
async fn list_with_start_after_and_limit() -> CResult<()> {
    let engine = engine();
    for (k, v) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
        engine.put(k.as_bytes(), int(v)).await?;
    }

    let listed = engine
        .list(ListOptions { start_after: Some(b"b".to_vec()), limit: Some(2), ..Default::default() })
        .await?;
    let keys: Vec<String> = listed.iter().map(|(k, _)| String::from_utf8(k.clone()).unwrap()).collect();
    let values: Vec<i64> = listed.iter().map(|(_, v)| parse(v)).collect();
    assert_eq!(keys, vec!["c", "d"]);
    assert_eq!(values, vec![3, 4]);
    Ok(())
}

/// Scenario 4: sequential `put`s issued without an intervening await
/// point that would let the flush run must coalesce into exactly one
/// backing `put_many`, keeping only the last value per key.
#[tokio::test]
async fn write_coalescing() -> CResult<()> {
    let put_many_calls = Arc::new(AtomicUsize::new(0));
    let backing = CountingStorage {
        inner: MemoryStorage::new(),
        put_many_calls: put_many_calls.clone(),
        delete_many_calls: Arc::new(AtomicUsize::new(0)),
    };
    let engine = StorageEngine::new(ObjectKey::from("coalesce"), backing, true);

    engine.put(b"x", int(1)).await?;
    engine.put(b"y", int(2)).await?;
    engine.put(b"x", int(3)).await?;
    engine.put(b"x", int(4)).await?;
    engine.sync().await;

    assert_eq!(put_many_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get(b"x").await?, Some(int(4)));
    assert_eq!(engine.get(b"y").await?, Some(int(2)));
    Ok(())
}

/// Scenario 5: delete coalescing alongside puts, preserving the
/// was-it-present-before-the-put existence count.
#[tokio::test]
async fn delete_coalescing_with_existence() -> CResult<()> {
    let engine = engine();
    engine.put(b"k6", int(6)).await?;
    engine.sync().await;

    engine.put(b"k1", int(1)).await?;
    engine.put(b"k2", int(2)).await?;
    engine.put(b"k3", int(3)).await?;
    let deleted = engine
        .delete_many(vec![b"k1".to_vec(), b"k2".to_vec(), b"k4".to_vec(), b"k6".to_vec()])
        .await?;
    assert_eq!(deleted, 3);
    assert!(!engine.delete(b"k5").await?);
    engine.put(b"k4", int(4)).await?;
    engine.put(b"k5", int(5)).await?;
    engine.put(b"k1", int(10)).await?;
    engine.sync().await;

    let mut final_state: Vec<(String, i64)> = engine
        .list(ListOptions::default())
        .await?
        .into_iter()
        .map(|(k, v)| (String::from_utf8(k).unwrap(), parse(&v)))
        .collect();
    final_state.sort();
    assert_eq!(
        final_state,
        vec![
            ("k1".to_string(), 10),
            ("k3".to_string(), 3),
            ("k4".to_string(), 4),
            ("k5".to_string(), 5),
        ]
    );
    Ok(())
}

/// Scenario 6: an alarm already due by the time the scheduler loads its
/// store fires promptly once timers are armed, rather than waiting for
/// the next poll interval.
#[tokio::test]
async fn alarm_catch_up_on_startup() {
    use objstore::alarm::AlarmScheduler;
    use objstore::config::ResolvedConfig;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;

    let scheduler = AlarmScheduler::new(MemoryStorage::new(), &ResolvedConfig::default());
    scheduler.set_alarm(ObjectKey::from("late-object"), now_ms - 1_000).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_inner = fired.clone();
    scheduler
        .setup_alarms(move |_key| {
            let fired_inner = fired_inner.clone();
            Box::pin(async move {
                fired_inner.fetch_add(1, Ordering::SeqCst);
            })
        })
        .await;

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
