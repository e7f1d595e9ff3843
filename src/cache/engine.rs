//! Read-through query cache with stale-while-revalidate.
//!
//! Every store fault on this path is absorbed and treated as a miss; only the
//! upstream fetch can fail a call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::background::BackgroundTasks;
use super::config::QueryCacheOptions;
use super::freshness::{EntryTiming, Freshness};
use super::keys::{CacheKey, QueryParams, query_key};
use super::store::{CacheEntry, CacheStore, EntryStore};
use super::tag_index::{IndexScope, TagIndex};

const METRIC_QUERY_HIT_TOTAL: &str = "quire_query_cache_hit_total";
const METRIC_QUERY_STALE_TOTAL: &str = "quire_query_cache_stale_total";
const METRIC_QUERY_MISS_TOTAL: &str = "quire_query_cache_miss_total";
const METRIC_REVALIDATE_FAILED_TOTAL: &str = "quire_query_cache_revalidate_failed_total";
pub(crate) const METRIC_STORE_ERROR_TOTAL: &str = "quire_cache_store_error_total";

/// How a query result was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream result together with the sync tags that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    pub tags: Vec<String>,
}

/// Outcome of [`QueryCache::cached_fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<T> {
    pub data: T,
    pub tags: Vec<String>,
    pub status: CacheStatus,
    /// Whole seconds since the served entry was written; absent on a miss.
    pub age: Option<u64>,
}

impl<T> CachedResult<T> {
    fn miss(fetched: Fetched<T>) -> Self {
        Self {
            data: fetched.data,
            tags: fetched.tags,
            status: CacheStatus::Miss,
            age: None,
        }
    }

    fn cached(entry: CacheEntry<T>, status: CacheStatus, age: u64) -> Self {
        Self {
            data: entry.data,
            tags: entry.tags,
            status,
            age: Some(age),
        }
    }
}

/// Query-result cache over a shared [`CacheStore`].
#[derive(Clone)]
pub struct QueryCache {
    entries: EntryStore,
    index: TagIndex,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            entries: EntryStore::new(store.clone()),
            index: TagIndex::new(store, IndexScope::Query),
        }
    }

    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    /// Serve `query` from cache, calling `fetch` only on a miss or, for stale
    /// entries, in the background.
    ///
    /// With `background` present, write-through and revalidation are spawned
    /// onto it and never block the caller. Without it, write-through is
    /// awaited inline and revalidation is detached.
    pub async fn cached_fetch<T, E, F, Fut>(
        &self,
        query: &str,
        params: &QueryParams,
        fetch: F,
        options: &QueryCacheOptions,
        background: Option<&BackgroundTasks>,
    ) -> Result<CachedResult<T>, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<T>, E>> + Send + 'static,
    {
        let key = query_key(query, params, &options.key_prefix);

        if let Some(entry) = self.lookup::<T>(&key).await {
            match entry.timing.evaluate(OffsetDateTime::now_utc()) {
                Some((Freshness::Fresh, age)) => {
                    counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                    debug!(
                        cache = "query",
                        outcome = "hit",
                        key = %key,
                        age,
                        "Serving cached query"
                    );
                    return Ok(CachedResult::cached(entry, CacheStatus::Hit, age));
                }
                Some((Freshness::Stale, age)) => {
                    counter!(METRIC_QUERY_STALE_TOTAL).increment(1);
                    debug!(
                        cache = "query",
                        outcome = "stale",
                        key = %key,
                        age,
                        "Serving stale query"
                    );
                    self.revalidate(key, fetch, options, background);
                    return Ok(CachedResult::cached(entry, CacheStatus::Stale, age));
                }
                Some((Freshness::Expired, age)) => {
                    debug!(
                        cache = "query",
                        outcome = "expired",
                        key = %key,
                        age,
                        "Cached query expired"
                    );
                }
                None => {
                    warn!(cache = "query", key = %key, "Cached query has unusable timestamp");
                }
            }
        }

        counter!(METRIC_QUERY_MISS_TOTAL).increment(1);
        debug!(cache = "query", outcome = "miss", key = %key, "Fetching query from source");

        let fetched = fetch().await?;
        let entry = CacheEntry {
            data: fetched.data.clone(),
            tags: fetched.tags.clone(),
            timing: EntryTiming::new(
                OffsetDateTime::now_utc(),
                options.max_age,
                options.stale_while_revalidate,
            ),
        };

        match background {
            Some(tasks) => {
                let cache = self.clone();
                tasks.spawn("query_write_through", async move {
                    cache.store_entry(&key, &entry).await;
                });
            }
            None => self.store_entry(&key, &entry).await,
        }

        Ok(CachedResult::miss(fetched))
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        match self.entries.read(key).await {
            Ok(entry) => entry,
            Err(err) => {
                counter!(METRIC_STORE_ERROR_TOTAL, "op" => "get").increment(1);
                warn!(
                    cache = "query",
                    key = %key,
                    error = %err,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    fn revalidate<T, E, F, Fut>(
        &self,
        key: CacheKey,
        fetch: F,
        options: &QueryCacheOptions,
        background: Option<&BackgroundTasks>,
    ) where
        T: Serialize + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<T>, E>> + Send + 'static,
    {
        let cache = self.clone();
        let (max_age, stale_while_revalidate) = (options.max_age, options.stale_while_revalidate);

        let task = async move {
            match fetch().await {
                Ok(fetched) => {
                    let entry = CacheEntry {
                        data: fetched.data,
                        tags: fetched.tags,
                        timing: EntryTiming::new(
                            OffsetDateTime::now_utc(),
                            max_age,
                            stale_while_revalidate,
                        ),
                    };
                    cache.store_entry(&key, &entry).await;
                    debug!(cache = "query", key = %key, "Revalidated stale query");
                }
                Err(err) => {
                    counter!(METRIC_REVALIDATE_FAILED_TOTAL).increment(1);
                    warn!(
                        cache = "query",
                        key = %key,
                        error = %err,
                        "Background revalidation failed, keeping stale entry"
                    );
                }
            }
        };

        match background {
            Some(tasks) => {
                tasks.spawn("query_revalidate", task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }

    async fn store_entry<T: Serialize + Sync>(&self, key: &CacheKey, entry: &CacheEntry<T>) {
        if let Err(err) = self.entries.write(key, entry).await {
            counter!(METRIC_STORE_ERROR_TOTAL, "op" => "put").increment(1);
            warn!(cache = "query", key = %key, error = %err, "Cache write failed");
            return;
        }
        if let Err(err) = self.index.add_entries(key, &entry.tags).await {
            counter!(METRIC_STORE_ERROR_TOTAL, "op" => "index").increment(1);
            warn!(
                cache = "query",
                key = %key,
                error = %err,
                "Tag registration failed, entry will only expire naturally"
            );
        }
    }
}
