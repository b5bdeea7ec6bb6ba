//! DataLoader for Magic RPC.
//!
//! Provides batching and caching to prevent N+1 fetches while relation fields
//! are resolved. A loader collects every key requested during one batching
//! window, hands the distinct keys to its batch function in a single call and
//! caches the outcome for its own lifetime. Loaders are created per request,
//! so the cache never outlives the request that filled it.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 100;

/// Error returned by a batch function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LoadError(pub String);

impl LoadError {
    /// Creates a new load error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Output of a batch function.
pub type BatchResult<K, V> = Result<HashMap<K, V>, LoadError>;

/// A type-erased batch function.
pub type BatchFn<K, V> = Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, BatchResult<K, V>> + Send + Sync>;

type SharedBatch<K, V> = Shared<BoxFuture<'static, Result<Arc<HashMap<K, V>>, LoadError>>>;

/// How long a loader waits for more keys before dispatching a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchWindow {
    /// Dispatch once a scheduler yield passes without new keys joining the
    /// batch.
    #[default]
    Yield,
    /// Wait a fixed delay first. Useful when loads come from spawned tasks.
    Delay(Duration),
}

impl BatchWindow {
    async fn wait(self) {
        match self {
            Self::Yield => tokio::task::yield_now().await,
            Self::Delay(delay) => tokio::time::sleep(delay).await,
        }
    }
}

struct PendingBatch<K, V> {
    keys: Arc<Mutex<Option<Vec<K>>>>,
    future: SharedBatch<K, V>,
}

struct LoaderState<K, V> {
    cache: FxHashMap<K, SharedBatch<K, V>>,
    pending: Option<PendingBatch<K, V>>,
}

/// A DataLoader that batches and caches loads.
pub struct DataLoader<K, V> {
    name: Arc<str>,
    batch_fn: BatchFn<K, V>,
    state: Arc<Mutex<LoaderState<K, V>>>,
    batch_size: usize,
    window: BatchWindow,
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new DataLoader.
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<K, V>> + Send + 'static,
    {
        Self::from_batch_fn(Arc::new(move |keys| batch_fn(keys).boxed()))
    }

    /// Creates a DataLoader around an already shared batch function.
    pub fn from_batch_fn(batch_fn: BatchFn<K, V>) -> Self {
        Self {
            name: Arc::from("loader"),
            batch_fn,
            state: Arc::new(Mutex::new(LoaderState {
                cache: FxHashMap::default(),
                pending: None,
            })),
            batch_size: DEFAULT_BATCH_SIZE,
            window: BatchWindow::default(),
        }
    }

    /// Sets the name used in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    /// Sets the maximum batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the batching window.
    pub fn window(mut self, window: BatchWindow) -> Self {
        self.window = window;
        self
    }

    /// Returns the loader name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads a value by key. Keys the batch function did not return load as
    /// `None`.
    pub async fn load(&self, key: K) -> Result<Option<V>, LoadError> {
        let batch = {
            let mut state = self.state.lock().await;
            match state.cache.get(&key) {
                Some(batch) => batch.clone(),
                None => {
                    let batch = self.enqueue(&mut state, key.clone()).await;
                    state.cache.insert(key.clone(), batch.clone());
                    batch
                }
            }
        };

        let values = batch.await?;
        Ok(values.get(&key).cloned())
    }

    /// Loads multiple values. All keys share the same batching window.
    pub async fn load_many(&self, keys: Vec<K>) -> Result<HashMap<K, V>, LoadError> {
        let loads = keys.into_iter().map(|key| async move {
            let value = self.load(key.clone()).await?;
            Ok::<_, LoadError>(value.map(|v| (key, v)))
        });
        let results = future::try_join_all(loads).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Clears the cache.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.cache.clear();
    }

    /// Clears a specific key from the cache.
    pub async fn clear_key(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.cache.remove(key);
    }

    /// Primes the cache with a value. Keys that are already cached or in
    /// flight keep their existing value.
    pub async fn prime(&self, key: K, value: V) {
        let mut state = self.state.lock().await;
        if state.cache.contains_key(&key) {
            return;
        }
        let mut values = HashMap::with_capacity(1);
        values.insert(key.clone(), value);
        let ready = future::ready(Ok(Arc::new(values))).boxed().shared();
        state.cache.insert(key, ready);
    }

    async fn enqueue(&self, state: &mut LoaderState<K, V>, key: K) -> SharedBatch<K, V> {
        if let Some(pending) = &state.pending {
            let mut guard = pending.keys.lock().await;
            if let Some(keys) = guard.as_mut() {
                if keys.len() < self.batch_size {
                    keys.push(key);
                    return pending.future.clone();
                }
            }
        }

        let keys = Arc::new(Mutex::new(Some(vec![key])));
        let future = self.dispatch(Arc::clone(&keys));
        state.pending = Some(PendingBatch {
            keys,
            future: future.clone(),
        });
        future
    }

    /// Starts the batch task. The window runs on its own task so that callers
    /// polling the shared result cannot cut it short.
    fn dispatch(&self, keys: Arc<Mutex<Option<Vec<K>>>>) -> SharedBatch<K, V> {
        let batch_fn = Arc::clone(&self.batch_fn);
        let name = Arc::clone(&self.name);
        let window = self.window;

        let task = tokio::spawn(async move {
            window.wait().await;
            let keys = settle(&keys).await;
            debug!(loader = %name, keys = keys.len(), "dispatching batch");
            batch_fn(keys).await
        });

        async move {
            match task.await {
                Ok(result) => result.map(Arc::new),
                Err(e) => Err(LoadError::new(format!("batch task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

/// Yields until no more keys join the pending batch, then takes them.
async fn settle<K>(keys: &Mutex<Option<Vec<K>>>) -> Vec<K> {
    let mut seen = 0;
    loop {
        {
            let mut guard = keys.lock().await;
            let len = guard.as_ref().map_or(0, Vec::len);
            if len == seen {
                return guard.take().unwrap_or_default();
            }
            seen = len;
        }
        tokio::task::yield_now().await;
    }
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            batch_fn: Arc::clone(&self.batch_fn),
            state: Arc::clone(&self.state),
            batch_size: self.batch_size,
            window: self.window,
        }
    }
}

impl<K, V> fmt::Debug for DataLoader<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("window", &self.window)
            .finish()
    }
}

/// Creates a simple DataLoader with a batch function.
pub fn create_loader<K, V, F, Fut>(batch_fn: F) -> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BatchResult<K, V>> + Send + 'static,
{
    DataLoader::new(batch_fn)
}

/// A loader keyed by string ids yielding JSON values.
pub type ValueLoader = DataLoader<String, Value>;

/// A batch function for [`ValueLoader`]s.
pub type ValueBatchFn = BatchFn<String, Value>;

/// Name-keyed set of loaders available to one request.
#[derive(Debug, Clone, Default)]
pub struct LoaderSet {
    loaders: IndexMap<String, ValueLoader>,
}

impl LoaderSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loader, replacing any loader with the same name.
    pub fn insert(&mut self, name: impl Into<String>, loader: ValueLoader) {
        let name = name.into();
        let loader = loader.named(name.clone());
        self.loaders.insert(name, loader);
    }

    /// Adds a loader and returns self.
    pub fn with(mut self, name: impl Into<String>, loader: ValueLoader) -> Self {
        self.insert(name, loader);
        self
    }

    /// Gets a loader by name.
    pub fn get(&self, name: &str) -> Option<&ValueLoader> {
        self.loaders.get(name)
    }

    /// Returns true if a loader with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.loaders.contains_key(name)
    }

    /// Moves every loader of `other` into this set. Loaders of `other` win on
    /// name clashes.
    pub fn merge(&mut self, other: LoaderSet) {
        self.loaders.extend(other.loaders);
    }

    /// Returns the loader names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    /// Returns the number of loaders.
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}
