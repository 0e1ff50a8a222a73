use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Pluggable key/value store used to memoize domain payloads by id.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn delete(&self, key: &str) -> Option<Value>;

    fn get_or_compute(&self, key: &str, producer: &dyn Fn() -> Value) -> Value {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = producer();
        self.set(key, value.clone());
        value
    }
}

/// In-memory backing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: Value) {
        self.inner.insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, v)| v)
    }
}

type StoreFactory = dyn Fn() -> Arc<dyn Store> + Send + Sync;

/// Composes named sub-caches (`"user"`, `"guild"`, `"channel"`, …), each
/// lazily materialized with the configured default backing.
pub struct CacheManager {
    stores: DashMap<String, Arc<dyn Store>>,
    default_backing: Box<StoreFactory>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::with_backing(|| Arc::new(MemoryStore::new()))
    }

    pub fn with_backing<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Store> + Send + Sync + 'static,
    {
        Self {
            stores: DashMap::new(),
            default_backing: Box::new(factory),
        }
    }

    /// Replace the backing for one named sub-cache.
    pub fn register(&self, name: impl Into<String>, store: Arc<dyn Store>) {
        self.stores.insert(name.into(), store);
    }

    pub fn named(&self, name: &str) -> Arc<dyn Store> {
        self.stores
            .entry(name.to_owned())
            .or_insert_with(|| (self.default_backing)())
            .clone()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("stores", &self.stores.len())
            .finish()
    }
}
