use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};
use log::debug;
use crate::engine::Durable;
use crate::{Collection, Error, Result};

/// Tuning knobs for the [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Once the cache holds this many keys, it is cleared before the next new key is inserted.
    pub cache_max_keys: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { cache_max_keys: 32 }
    }
}

/// Durable key -> collection storage with an in-process read cache.
///
/// The cache mirrors the durable layer exactly after every successful write.
/// All writes to one key, and every cache fill for that key, run inside a
/// per-key async mutex, so read-modify-write sequences issued through
/// [`Store::update`] never interleave.
pub struct Store {
    durable: Arc<dyn Durable>,
    cache: RwLock<HashMap<String, Collection>>,
    locks: Mutex<HashMap<String, Arc<KeyMutex<()>>>>,
    config: StoreConfig,
}

impl Store {
    pub fn new(durable: Arc<dyn Durable>, config: StoreConfig) -> Self {
        Self {
            durable,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns the collection stored under `key`, or `default` if none exists.
    ///
    /// The result is a shallow copy: the vector belongs to the caller, the
    /// documents inside it are shared with the cache. Callers must replace
    /// documents wholesale (build a new value, or go through
    /// `Arc::make_mut`, which copies on write) and hand the whole collection
    /// back to [`Store::set`]. Nothing a caller does to the returned value
    /// can reach the cached copy.
    ///
    /// A default that gets returned is cached but not written durably.
    pub async fn get(&self, key: &str, default: Collection) -> Result<Collection> {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        let _guard = self.lock_key(key).await;
        self.read_through(key, default).await
    }

    /// Overwrites `key` durably, then updates the cache.
    ///
    /// Once this resolves, every later [`Store::get`] observes `value`.
    pub async fn set(&self, key: &str, value: Collection) -> Result<()> {
        let _guard = self.lock_key(key).await;
        self.write_through(key, value).await
    }

    /// Read-modify-write of one collection under the key's exclusive section.
    ///
    /// `f` receives a private copy. If it returns an error nothing is written.
    pub async fn update<T, F>(&self, key: &str, default: Collection, f: F) -> Result<T>
    where
        F: FnOnce(&mut Collection) -> Result<T>,
    {
        let _guard = self.lock_key(key).await;
        let mut current = self.read_through(key, default).await?;
        let out = f(&mut current)?;
        self.write_through(key, current).await?;
        Ok(out)
    }

    /// Number of keys currently held in the cache.
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn cached(&self, key: &str) -> Option<Collection> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, key: &str, value: Collection) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if !cache.contains_key(key) && cache.len() >= self.config.cache_max_keys {
            debug!("Cache holds {} keys, clearing before inserting {}", cache.len(), key);
            cache.clear();
        }
        cache.insert(key.to_string(), value);
    }

    async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    // Caller holds the key lock.
    async fn read_through(&self, key: &str, default: Collection) -> Result<Collection> {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        let durable = self.durable.clone();
        let owned_key = key.to_string();
        let loaded = tokio::task::spawn_blocking(move || durable.load(&owned_key))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        let value = loaded.unwrap_or(default);
        self.remember(key, value.clone());
        Ok(value)
    }

    // Caller holds the key lock.
    async fn write_through(&self, key: &str, value: Collection) -> Result<()> {
        let durable = self.durable.clone();
        let owned_key = key.to_string();
        let to_save = value.clone();
        tokio::task::spawn_blocking(move || durable.save(&owned_key, &to_save))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        self.remember(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryDurable, Persistence};
    use serde_json::json;
    use tempfile::tempdir;

    fn memory_store() -> Store {
        Store::new(Arc::new(MemoryDurable::new()), StoreConfig::default())
    }

    fn doc(v: serde_json::Value) -> crate::Document {
        Arc::new(v)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = memory_store();
        let value = vec![doc(json!({"id": "t1"})), doc(json!({"id": "t2"}))];
        store.set("tasks", value.clone()).await.unwrap();

        assert_eq!(store.get("tasks", Vec::new()).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_returned_value_is_isolated() {
        let store = memory_store();
        store.set("users", vec![doc(json!({"id": "u1", "points": 10}))]).await.unwrap();

        let mut copy = store.get("users", Vec::new()).await.unwrap();
        copy.push(doc(json!({"id": "u2"})));
        Arc::make_mut(&mut copy[0])["points"] = json!(99);

        let again = store.get("users", Vec::new()).await.unwrap();
        assert_eq!(again, vec![doc(json!({"id": "u1", "points": 10}))]);
    }

    #[tokio::test]
    async fn test_default_is_materialized_but_not_persisted() {
        let durable = Arc::new(MemoryDurable::new());
        let store = Store::new(durable.clone(), StoreConfig::default());

        let got = store.get("rewards", vec![doc(json!({"id": "r0"}))]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(store.cached_len(), 1);
        assert!(durable.load("rewards").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cold_read_comes_from_durable_layer() {
        let durable = Arc::new(MemoryDurable::new());
        durable.save("classes", &vec![doc(json!({"id": "c1"}))]).unwrap();
        let store = Store::new(durable, StoreConfig::default());

        let got = store.get("classes", Vec::new()).await.unwrap();
        assert_eq!(got, vec![doc(json!({"id": "c1"}))]);
    }

    #[tokio::test]
    async fn test_cache_clears_past_threshold() {
        let durable = Arc::new(MemoryDurable::new());
        let store = Store::new(durable, StoreConfig { cache_max_keys: 2 });

        store.set("a", vec![doc(json!(1))]).await.unwrap();
        store.set("b", vec![doc(json!(2))]).await.unwrap();
        assert_eq!(store.cached_len(), 2);

        store.set("c", vec![doc(json!(3))]).await.unwrap();
        assert_eq!(store.cached_len(), 1);

        // Evicted keys are still served from the durable layer.
        assert_eq!(store.get("a", Vec::new()).await.unwrap(), vec![doc(json!(1))]);
    }

    #[tokio::test]
    async fn test_unavailable_storage_is_reported() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = Store::new(Arc::new(Persistence::new(&data_dir).unwrap()), StoreConfig::default());
        std::fs::remove_dir_all(&data_dir).unwrap();

        assert!(matches!(store.get("tasks", Vec::new()).await, Err(Error::StorageUnavailable(_))));
        assert!(matches!(store.set("tasks", Vec::new()).await, Err(Error::StorageUnavailable(_))));
        assert_eq!(store.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let store = Arc::new(memory_store());
        store.set("users", vec![doc(json!({"id": "u1", "points": 0}))]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("users", Vec::new(), |users| {
                        let points = users[0]["points"].as_i64().unwrap_or(0);
                        Arc::make_mut(&mut users[0])["points"] = json!(points + 1);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let users = store.get("users", Vec::new()).await.unwrap();
        assert_eq!(users[0]["points"], json!(50));
    }

    #[tokio::test]
    async fn test_failed_update_writes_nothing() {
        let store = memory_store();
        store.set("users", vec![doc(json!({"id": "u1"}))]).await.unwrap();

        let res: Result<()> = store
            .update("users", Vec::new(), |users| {
                users.clear();
                Err(Error::NotFound("u9".to_string()))
            })
            .await;
        assert!(matches!(res, Err(Error::NotFound(_))));
        assert_eq!(store.get("users", Vec::new()).await.unwrap().len(), 1);
    }
}
