//! Reverse index from invalidation tag to cache keys.
//!
//! The whole index is one serialized object under a reserved key and is
//! read-modify-written on every change. Concurrent registrations can race and
//! drop additions; an entry missed that way simply expires on its own.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::keys::CacheKey;
use super::store::{CacheStore, StoreError};

const QUERY_INDEX_NAME: &str = "tag-index";
const PAGE_INDEX_NAME: &str = "page-tag-index";

/// Tag → ordered set of keys.
pub type TagMap = BTreeMap<String, Vec<String>>;

/// Which family of cache keys an index tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexScope {
    /// Query-result cache keys.
    Query,
    /// Full-page URLs.
    Page,
}

impl IndexScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexScope::Query => "query",
            IndexScope::Page => "page",
        }
    }

    fn index_key(&self) -> CacheKey {
        match self {
            IndexScope::Query => CacheKey::reserved(QUERY_INDEX_NAME),
            IndexScope::Page => CacheKey::reserved(PAGE_INDEX_NAME),
        }
    }
}

/// Keys and tags removed by one [`TagIndex::purge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPurge {
    /// Keys whose delete the store confirmed.
    pub purged_keys: Vec<String>,
    /// Requested tags that were present in the index.
    pub found_tags: Vec<String>,
}

/// Persisted tag → key mapping for one [`IndexScope`].
#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn CacheStore>,
    scope: IndexScope,
}

impl TagIndex {
    pub fn new(store: Arc<dyn CacheStore>, scope: IndexScope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> IndexScope {
        self.scope
    }

    /// Current index contents; empty when absent, malformed or unreadable.
    pub async fn get(&self) -> TagMap {
        match self.load().await {
            Ok(map) => map,
            Err(err) => {
                warn!(
                    scope = self.scope.as_str(),
                    error = %err,
                    "Tag index unreadable, reporting empty"
                );
                TagMap::new()
            }
        }
    }

    /// Register `key` under every tag in `tags` (set semantics).
    ///
    /// For query keys, entries the store has already dropped are pruned from
    /// the touched tags first, so the index tracks live entries only.
    pub async fn add_entries(&self, key: &CacheKey, tags: &[String]) -> Result<(), StoreError> {
        let mut map = self.load().await?;
        let mut changed = false;
        if self.scope == IndexScope::Query {
            changed = self.prune_missing(&mut map, key, tags).await;
        }

        for tag in tags.iter().filter(|tag| !tag.is_empty()) {
            let keys = map.entry(tag.clone()).or_default();
            if !keys.iter().any(|existing| existing == key.as_str()) {
                keys.push(key.as_str().to_string());
                changed = true;
            }
        }

        if changed {
            self.save(&map).await?;
        }
        debug!(
            scope = self.scope.as_str(),
            key = %key,
            tag_count = tags.len(),
            "Registered cache key in tag index"
        );
        Ok(())
    }

    /// Delete every entry listed under `tags`, then drop those tags.
    ///
    /// Keys that were deleted are also pruned from any other tag that listed
    /// them, and tags left empty are removed. A failed delete is logged and
    /// left out of the result. Unknown tags are ignored.
    pub async fn purge(&self, tags: &[String]) -> Result<TagPurge, StoreError> {
        let mut map = self.load().await?;
        let mut outcome = TagPurge::default();
        let mut deleted: HashSet<String> = HashSet::new();
        let mut requested: HashSet<&str> = HashSet::new();

        for tag in tags {
            if !requested.insert(tag.as_str()) {
                continue;
            }
            let Some(keys) = map.remove(tag) else {
                continue;
            };
            outcome.found_tags.push(tag.clone());

            for key in keys {
                if deleted.contains(&key) {
                    continue;
                }
                match self.store.delete(&CacheKey::from(key.as_str())).await {
                    Ok(_) => {
                        deleted.insert(key.clone());
                        outcome.purged_keys.push(key);
                    }
                    Err(err) => warn!(
                        scope = self.scope.as_str(),
                        key = %key,
                        error = %err,
                        "Failed to delete cache entry during purge"
                    ),
                }
            }
        }

        if outcome.found_tags.is_empty() {
            return Ok(outcome);
        }

        map.retain(|_, keys| {
            keys.retain(|key| !deleted.contains(key));
            !keys.is_empty()
        });
        self.save(&map).await?;

        Ok(outcome)
    }

    /// Drop keys listed under `tags` that the store no longer holds.
    ///
    /// A key whose lookup fails is kept. Returns whether anything was removed.
    async fn prune_missing(&self, map: &mut TagMap, keep: &CacheKey, tags: &[String]) -> bool {
        let mut live: HashSet<String> = HashSet::new();
        let mut gone: HashSet<String> = HashSet::new();

        for tag in tags {
            let Some(keys) = map.get_mut(tag) else {
                continue;
            };
            let mut kept = Vec::with_capacity(keys.len());
            for existing in keys.drain(..) {
                if existing == keep.as_str() || live.contains(&existing) {
                    kept.push(existing);
                    continue;
                }
                if gone.contains(&existing) {
                    continue;
                }
                match self.store.get(&CacheKey::from(existing.as_str())).await {
                    Ok(None) => {
                        gone.insert(existing);
                    }
                    _ => {
                        live.insert(existing.clone());
                        kept.push(existing);
                    }
                }
            }
            *keys = kept;
        }

        if !gone.is_empty() {
            debug!(
                scope = self.scope.as_str(),
                pruned = gone.len(),
                "Pruned expired keys from tag index"
            );
        }
        !gone.is_empty()
    }

    async fn load(&self) -> Result<TagMap, StoreError> {
        let Some(bytes) = self.store.get(&self.scope.index_key()).await? else {
            return Ok(TagMap::new());
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => Ok(map),
            Err(err) => {
                warn!(
                    scope = self.scope.as_str(),
                    error = %err,
                    "Discarding malformed tag index"
                );
                Ok(TagMap::new())
            }
        }
    }

    async fn save(&self, map: &TagMap) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(map)?;
        self.store
            .put(&self.scope.index_key(), Bytes::from(bytes), None)
            .await
    }
}

/// Number of distinct keys across all tags.
pub fn distinct_key_count(map: &TagMap) -> usize {
    map.values()
        .flatten()
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .len()
}
