//! DataLoader for batched directives.
//!
//! Collects the keys requested by sibling resolutions and loads them with one
//! batch call. Values are cached for the lifetime of the loader, which is
//! request-scoped when obtained through [`Context::memo`](crate::Context::memo).

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// A failed load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The batch function failed.
    #[error("{0}")]
    Batch(String),

    /// The batch was dropped before it completed.
    #[error("batch load was cancelled")]
    Cancelled,
}

type BatchFn<K, V> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, Result<FxHashMap<K, V>, LoadError>> + Send + Sync>;

type Waiter<V> = oneshot::Sender<Result<Option<V>, LoadError>>;

/// A DataLoader that batches and caches loads.
pub struct DataLoader<K, V> {
    batch_fn: BatchFn<K, V>,
    cache: Mutex<FxHashMap<K, V>>,
    pending: Mutex<Vec<(K, Waiter<V>)>>,
    batch_size: usize,
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates a new DataLoader.
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FxHashMap<K, V>, LoadError>> + Send + 'static,
    {
        Self {
            batch_fn: Arc::new(move |keys| Box::pin(batch_fn(keys))),
            cache: Mutex::new(FxHashMap::default()),
            pending: Mutex::new(Vec::new()),
            batch_size: 100,
        }
    }

    /// Sets the maximum batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Loads a value by key, batching with concurrent loads.
    pub async fn load(&self, key: K) -> Result<Option<V>, LoadError> {
        if let Some(value) = self.cached(&key) {
            return Ok(Some(value));
        }

        let (tx, rx) = oneshot::channel();
        let dispatcher = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.push((key, tx));
            pending.len() == 1
        };

        if dispatcher {
            // Let sibling resolutions enqueue their keys first.
            tokio::task::yield_now().await;
            self.dispatch().await;
        }
        rx.await.unwrap_or(Err(LoadError::Cancelled))
    }

    /// Loads multiple values with one batch call for the uncached keys.
    pub async fn load_many(&self, keys: Vec<K>) -> Result<FxHashMap<K, V>, LoadError> {
        let mut found = FxHashMap::default();
        let mut missing = Vec::new();
        for key in keys {
            match self.cached(&key) {
                Some(value) => {
                    found.insert(key, value);
                }
                None if !missing.contains(&key) => missing.push(key),
                None => {}
            }
        }
        if !missing.is_empty() {
            let loaded = (self.batch_fn)(missing).await?;
            self.store(&loaded);
            found.extend(loaded);
        }
        Ok(found)
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Clears a specific key from the cache.
    pub fn clear_key(&self, key: &K) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Primes the cache with a value.
    pub fn prime(&self, key: K, value: V) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    fn cached(&self, key: &K) -> Option<V> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store(&self, values: &FxHashMap<K, V>) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in values {
            cache.insert(key.clone(), value.clone());
        }
    }

    async fn dispatch(&self) {
        let waiters = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut keys: Vec<K> = Vec::with_capacity(waiters.len());
        for (key, _) in &waiters {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut loaded = FxHashMap::default();
        let mut failure = None;
        for chunk in keys.chunks(self.batch_size) {
            debug!(keys = chunk.len(), "dispatching batch load");
            match (self.batch_fn)(chunk.to_vec()).await {
                Ok(values) => loaded.extend(values),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            self.store(&loaded);
        }

        for (key, tx) in waiters {
            let reply = match &failure {
                Some(e) => Err(e.clone()),
                None => Ok(loaded.get(&key).cloned()),
            };
            let _ = tx.send(reply);
        }
    }
}

impl<K, V> fmt::Debug for DataLoader<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doubling(calls: Arc<Mutex<Vec<Vec<i32>>>>) -> DataLoader<i32, i32> {
        DataLoader::new(move |keys: Vec<i32>| {
            calls.lock().unwrap().push(keys.clone());
            async move {
                Ok::<_, LoadError>(keys.into_iter().map(|k| (k, k * 2)).collect::<FxHashMap<_, _>>())
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_batch() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = doubling(Arc::clone(&calls));

        let results = join_all([1, 2, 2, 3].map(|k| loader.load(k))).await;
        let values: Vec<Option<i32>> = results.into_iter().map(Result::unwrap).collect();

        assert_eq!(values, vec![Some(2), Some(4), Some(4), Some(6)]);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_cached_keys_skip_the_batch() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = doubling(Arc::clone(&calls));
        loader.prime(1, 100);

        assert_eq!(loader.load(1).await.unwrap(), Some(100));
        let many = loader.load_many(vec![1, 5]).await.unwrap();
        assert_eq!(many.get(&5), Some(&10));
        assert_eq!(loader.load(5).await.unwrap(), Some(10));
        assert_eq!(*calls.lock().unwrap(), vec![vec![5]]);

        loader.clear();
        assert_eq!(loader.load(1).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_batch_size_and_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let loader: DataLoader<i32, i32> = DataLoader::new(move |keys: Vec<i32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if keys.contains(&13) {
                    Err(LoadError::Batch("unlucky".to_string()))
                } else {
                    Ok(keys.into_iter().map(|k| (k, k)).collect::<FxHashMap<_, _>>())
                }
            }
        })
        .batch_size(2);

        let results = join_all([1, 2, 3].map(|k| loader.load(k))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert_eq!(
            loader.load(13).await,
            Err(LoadError::Batch("unlucky".to_string()))
        );
    }
}
