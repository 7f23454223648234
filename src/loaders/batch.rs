use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::store::SqliteStore;

/// Fetches one batch. Must return exactly one slot per key, in key order.
pub type BatchFn<K, V> = Arc<dyn Fn(&SqliteStore, &[K]) -> Result<Vec<Option<V>>> + Send + Sync>;

type Waiter<V> = oneshot::Sender<Result<Option<V>>>;

struct Batch<K, V> {
    id: u64,
    keys: Vec<K>,
    waiters: Vec<(K, Waiter<V>)>,
}

struct State<K, V> {
    cache: HashMap<K, Option<V>>,
    pending: Option<Batch<K, V>>,
    next_batch_id: u64,
}

struct Shared<K, V> {
    name: &'static str,
    store: Arc<SqliteStore>,
    fetch: BatchFn<K, V>,
    wait: Duration,
    max_batch: usize,
    state: Mutex<State<K, V>>,
}

impl<K, V> Shared<K, V> {
    fn state(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coalescing loader.
///
/// Keys requested within `wait` of the first pending key are fetched
/// together in one database round-trip. A batch that reaches `max_batch`
/// keys is dispatched immediately. Results are cached for the loader's
/// lifetime, which is one request.
pub struct Loader<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Loader<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Slot<V> {
    Ready(Option<V>),
    Waiting(oneshot::Receiver<Result<Option<V>>>),
}

impl<K, V> Loader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        name: &'static str,
        store: Arc<SqliteStore>,
        wait: Duration,
        max_batch: usize,
        fetch: BatchFn<K, V>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                store,
                fetch,
                wait,
                max_batch: max_batch.max(1),
                state: Mutex::new(State {
                    cache: HashMap::new(),
                    pending: None,
                    next_batch_id: 0,
                }),
            }),
        }
    }

    /// Loads one key. A missing record is `Ok(None)`.
    pub async fn load(&self, key: K) -> Result<Option<V>> {
        match self.enqueue(key) {
            Slot::Ready(value) => Ok(value),
            Slot::Waiting(rx) => await_slot(rx).await,
        }
    }

    /// Loads many keys, coalescing them into as few batches as the cap
    /// allows. Results are in input order.
    pub async fn load_many(&self, keys: &[K]) -> Result<Vec<Option<V>>> {
        let slots: Vec<Slot<V>> = keys.iter().cloned().map(|key| self.enqueue(key)).collect();
        let mut values = Vec::with_capacity(slots.len());
        for slot in slots {
            values.push(match slot {
                Slot::Ready(value) => value,
                Slot::Waiting(rx) => await_slot(rx).await?,
            });
        }
        Ok(values)
    }

    /// Seeds the cache, e.g. with a record the caller just wrote.
    pub fn prime(&self, key: K, value: V) {
        self.shared.state().cache.insert(key, Some(value));
    }

    /// Drops a cached entry so the next load refetches it.
    pub fn forget(&self, key: &K) {
        self.shared.state().cache.remove(key);
    }

    fn enqueue(&self, key: K) -> Slot<V> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state();
        if let Some(value) = state.cache.get(&key) {
            return Slot::Ready(value.clone());
        }

        if state.pending.is_none() {
            let id = state.next_batch_id;
            state.next_batch_id += 1;
            state.pending = Some(Batch {
                id,
                keys: Vec::new(),
                waiters: Vec::new(),
            });
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(shared.wait).await;
                let batch = {
                    let mut state = shared.state();
                    match &state.pending {
                        Some(batch) if batch.id == id => state.pending.take(),
                        _ => None,
                    }
                };
                if let Some(batch) = batch {
                    dispatch(shared, batch).await;
                }
            });
        }

        let full = match state.pending.as_mut() {
            Some(batch) => {
                if !batch.keys.contains(&key) {
                    batch.keys.push(key.clone());
                }
                batch.waiters.push((key, tx));
                batch.keys.len() >= self.shared.max_batch
            }
            None => false,
        };
        if full {
            if let Some(batch) = state.pending.take() {
                tokio::spawn(dispatch(Arc::clone(&self.shared), batch));
            }
        }
        Slot::Waiting(rx)
    }
}

async fn await_slot<V>(rx: oneshot::Receiver<Result<Option<V>>>) -> Result<Option<V>> {
    rx.await
        .unwrap_or_else(|_| Err(Error::Batch("loader dropped before the batch completed".into())))
}

async fn dispatch<K, V>(shared: Arc<Shared<K, V>>, batch: Batch<K, V>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    let Batch { keys, waiters, .. } = batch;
    let store = Arc::clone(&shared.store);
    let fetch = Arc::clone(&shared.fetch);
    let batch_keys = keys.clone();
    let fetched = tokio::task::spawn_blocking(move || fetch(&store, &batch_keys))
        .await
        .unwrap_or_else(|e| Err(Error::Batch(format!("batch task failed: {e}"))));

    let results = match fetched {
        Ok(values) if values.len() == keys.len() => values,
        Ok(values) => {
            let error = Error::invariant(format!(
                "{} loader returned {} rows for {} keys",
                shared.name,
                values.len(),
                keys.len()
            ));
            fail(waiters, &error);
            return;
        }
        Err(e) => {
            tracing::warn!(loader = shared.name, keys = keys.len(), "batch load failed: {e}");
            fail(waiters, &e);
            return;
        }
    };

    let by_key: HashMap<K, Option<V>> = keys.into_iter().zip(results).collect();
    {
        let mut state = shared.state();
        for (key, value) in &by_key {
            state.cache.insert(key.clone(), value.clone());
        }
    }
    for (key, waiter) in waiters {
        let value = by_key.get(&key).cloned().flatten();
        // A dropped receiver means the caller stopped waiting.
        let _ = waiter.send(Ok(value));
    }
}

fn fail<K, V>(waiters: Vec<(K, Waiter<V>)>, error: &Error) {
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(error.share()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        Arc::new(store)
    }

    fn counting_loader(
        calls: Arc<AtomicUsize>,
        sizes: Arc<Mutex<Vec<usize>>>,
    ) -> Loader<i64, i64> {
        Loader::new(
            "squares",
            store(),
            Duration::from_millis(1),
            100,
            Arc::new(move |_store, keys: &[i64]| {
                calls.fetch_add(1, Ordering::SeqCst);
                sizes.lock().unwrap().push(keys.len());
                Ok(keys
                    .iter()
                    .map(|k| if *k < 0 { None } else { Some(k * k) })
                    .collect())
            }),
        )
    }

    #[tokio::test]
    async fn test_two_hundred_keys_take_two_batches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let loader = counting_loader(calls.clone(), sizes.clone());

        let keys: Vec<i64> = (1..=200).collect();
        let values = loader.load_many(&keys).await.unwrap();

        assert_eq!(values.len(), 200);
        assert_eq!(values[9], Some(100));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sizes.lock().unwrap(), vec![100, 100]);
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let loader = counting_loader(calls.clone(), sizes);

        let (a, b, c) = tokio::join!(loader.load(2), loader.load(3), loader.load(-1));
        assert_eq!(a.unwrap(), Some(4));
        assert_eq!(b.unwrap(), Some(9));
        assert_eq!(c.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let loader = counting_loader(calls.clone(), sizes);

        assert_eq!(loader.load(5).await.unwrap(), Some(25));
        assert_eq!(loader.load(5).await.unwrap(), Some(25));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        loader.forget(&5);
        loader.load(5).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_failure_reaches_every_waiter() {
        let loader: Loader<i64, i64> = Loader::new(
            "broken",
            store(),
            Duration::from_millis(1),
            100,
            Arc::new(|_store, _keys: &[i64]| Err(Error::Invalid("boom".into()))),
        );
        let (a, b) = tokio::join!(loader.load(1), loader.load(2));
        assert!(matches!(a, Err(Error::Invalid(_))));
        assert!(matches!(b, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn test_batch_failure_keeps_its_kind() {
        let upstream: Loader<i64, i64> = Loader::new(
            "federated",
            store(),
            Duration::from_millis(1),
            100,
            Arc::new(|_store, _keys: &[i64]| Err(Error::Upstream("meta down".into()))),
        );
        let (a, b) = tokio::join!(upstream.load(1), upstream.load(2));
        assert!(matches!(a, Err(Error::Upstream(_))));
        assert!(matches!(b, Err(Error::Upstream(_))));

        let short: Loader<i64, i64> = Loader::new(
            "short",
            store(),
            Duration::from_millis(1),
            100,
            Arc::new(|_store, _keys: &[i64]| Ok(Vec::new())),
        );
        assert!(matches!(short.load(1).await, Err(Error::Invariant(_))));

        let database: Loader<i64, i64> = Loader::new(
            "database",
            store(),
            Duration::from_millis(1),
            100,
            Arc::new(|_store, _keys: &[i64]| {
                Err(Error::Database(rusqlite::Error::QueryReturnedNoRows))
            }),
        );
        assert!(matches!(database.load(1).await, Err(Error::Batch(_))));
    }

    #[tokio::test]
    async fn test_duplicate_keys_share_a_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let loader = counting_loader(calls, sizes.clone());
        let values = loader.load_many(&[7, 7, 8]).await.unwrap();
        assert_eq!(values, vec![Some(49), Some(49), Some(64)]);
        assert_eq!(*sizes.lock().unwrap(), vec![2]);
    }
}
