//! Cache storage.
//!
//! `CacheStore` is the contract over a shared key-value store of opaque bytes.
//! `MemoryStore` is the in-process backend; `EntryStore` layers the typed
//! `CacheEntry` envelope on top of any backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

use super::config::CacheConfig;
use super::freshness::EntryTiming;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_STORE_EVICT_TOTAL: &str = "quire_cache_store_evict_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store operation failed: {0}")]
    Operation(String),
    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Shared key-value store holding opaque entry bytes.
///
/// No transactional guarantees across keys. Callers treat every error as
/// absence.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError>;

    /// Store `value`; the store may drop it once `ttl_hint` has elapsed.
    async fn put(
        &self,
        key: &CacheKey,
        value: Bytes,
        ttl_hint: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Remove `key`, returning whether an entry existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError>;
}

// ============================================================================
// Memory Store
// ============================================================================

#[derive(Clone)]
struct StoredValue {
    bytes: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process LRU store honouring TTL hints.
///
/// Reserved keys (the tag indexes) live outside the LRU so a burst of entry
/// writes can never evict them.
pub struct MemoryStore {
    entries: RwLock<LruCache<CacheKey, StoredValue>>,
    reserved: RwLock<HashMap<CacheKey, StoredValue>>,
}

impl MemoryStore {
    /// Create a new memory store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.store_capacity_non_zero())),
            reserved: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of stored entries, expired and reserved ones included.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
            + rw_read(&self.reserved, SOURCE, "len").len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        if key.is_reserved() {
            let mut reserved = rw_write(&self.reserved, SOURCE, "get");
            let live = reserved
                .get(key)
                .filter(|value| !value.is_expired(Instant::now()))
                .map(|value| value.bytes.clone());
            if live.is_none() {
                reserved.remove(key);
            }
            return Ok(live);
        }

        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(value) if value.is_expired(Instant::now()) => true,
            Some(value) => return Ok(Some(value.bytes.clone())),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: Bytes,
        ttl_hint: Option<Duration>,
    ) -> Result<(), StoreError> {
        let stored = StoredValue {
            bytes: value,
            expires_at: ttl_hint.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        if key.is_reserved() {
            rw_write(&self.reserved, SOURCE, "put").insert(key.clone(), stored);
            return Ok(());
        }

        let evicted = rw_write(&self.entries, SOURCE, "put").push(key.clone(), stored);
        if let Some((evicted_key, _)) = evicted
            && &evicted_key != key
        {
            counter!(METRIC_STORE_EVICT_TOTAL).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        if key.is_reserved() {
            return Ok(rw_write(&self.reserved, SOURCE, "delete").remove(key).is_some());
        }
        Ok(rw_write(&self.entries, SOURCE, "delete").pop(key).is_some())
    }
}

// ============================================================================
// Typed entries
// ============================================================================

/// A cached query result plus its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub timing: EntryTiming,
}

/// Typed view over a [`CacheStore`].
#[derive(Clone)]
pub struct EntryStore {
    store: Arc<dyn CacheStore>,
}

impl EntryStore {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Read and decode an entry. A payload that does not decode reads as absent.
    pub async fn read<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry<T>>, StoreError> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(
                    key = %key,
                    error = %err,
                    "Discarding malformed cache entry"
                );
                Ok(None)
            }
        }
    }

    pub async fn write<T: Serialize>(
        &self,
        key: &CacheKey,
        entry: &CacheEntry<T>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entry)?;
        self.store
            .put(key, Bytes::from(bytes), Some(entry.timing.ttl_hint()))
            .await
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.store.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::{Value, json};
    use time::OffsetDateTime;

    use super::*;

    fn entry(data: Value, tags: &[&str]) -> CacheEntry<Value> {
        CacheEntry {
            data,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            timing: EntryTiming::new(OffsetDateTime::now_utc(), 60, 300),
        }
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new(&CacheConfig::default());
        let key = CacheKey::from("k");

        assert!(store.get(&key).await.expect("get").is_none());
        store
            .put(&key, Bytes::from_static(b"hello"), None)
            .await
            .expect("put");
        assert_eq!(
            store.get(&key).await.expect("get"),
            Some(Bytes::from_static(b"hello"))
        );

        assert!(store.delete(&key).await.expect("delete"));
        assert!(!store.delete(&key).await.expect("delete again"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_drops_entries_past_ttl_hint() {
        let store = MemoryStore::new(&CacheConfig::default());
        let key = CacheKey::from("short-lived");

        store
            .put(&key, Bytes::from_static(b"x"), Some(Duration::ZERO))
            .await
            .expect("put");

        assert!(store.get(&key).await.expect("get").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_lru_eviction() {
        let config = CacheConfig {
            store_capacity: 2,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);

        for name in ["a", "b", "c"] {
            store
                .put(&CacheKey::from(name), Bytes::from_static(b"v"), None)
                .await
                .expect("put");
        }

        assert!(store.get(&CacheKey::from("a")).await.expect("get").is_none()); // Evicted
        assert!(store.get(&CacheKey::from("b")).await.expect("get").is_some());
        assert!(store.get(&CacheKey::from("c")).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn reserved_keys_survive_lru_pressure() {
        let config = CacheConfig {
            store_capacity: 2,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);
        let index = CacheKey::reserved("tag-index");

        store
            .put(&index, Bytes::from_static(b"{}"), None)
            .await
            .expect("put index");
        for name in ["a", "b", "c", "d"] {
            store
                .put(&CacheKey::from(name), Bytes::from_static(b"v"), None)
                .await
                .expect("put");
        }

        assert_eq!(store.get(&index).await.expect("get"), Some(Bytes::from_static(b"{}")));
        assert!(store.get(&CacheKey::from("b")).await.expect("get").is_none());
        assert_eq!(store.len(), 3);

        assert!(store.delete(&index).await.expect("delete"));
        assert!(store.get(&index).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn entry_store_roundtrip_preserves_data_and_tags() {
        let entries = EntryStore::new(Arc::new(MemoryStore::new(&CacheConfig::default())));
        let key = CacheKey::from("entry");
        let written = entry(json!({ "title": "Hello" }), &["a", "b"]);

        entries.write(&key, &written).await.expect("write");
        let read: CacheEntry<Value> = entries.read(&key).await.expect("read").expect("present");

        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn malformed_entry_reads_as_absent() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let key = CacheKey::from("garbage");
        store
            .put(&key, Bytes::from_static(b"{\"data\":1}"), None)
            .await
            .expect("put");

        let entries = EntryStore::new(store);
        let read: Option<CacheEntry<Value>> = entries.read(&key).await.expect("read");
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn memory_store_recovers_from_poisoned_lock() {
        let store = MemoryStore::new(&CacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        let key = CacheKey::from("after-poison");
        store
            .put(&key, Bytes::from_static(b"ok"), None)
            .await
            .expect("put");
        assert!(store.get(&key).await.expect("get").is_some());
    }
}
