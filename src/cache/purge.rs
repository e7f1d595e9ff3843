//! Tag-driven invalidation across the query and page indexes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{info, instrument, warn};

use super::store::CacheStore;
use super::tag_index::{IndexScope, TagIndex, TagPurge};

const METRIC_PURGE_MS: &str = "quire_cache_purge_ms";
const METRIC_PURGED_KEYS_TOTAL: &str = "quire_cache_purged_keys_total";

/// What one purge removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged_query_keys: Vec<String>,
    pub purged_page_urls: Vec<String>,
    /// Requested tags found in either index.
    pub purged_tags: Vec<String>,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.purged_query_keys.is_empty()
            && self.purged_page_urls.is_empty()
            && self.purged_tags.is_empty()
    }
}

/// Drives both tag indexes with one tag set.
#[derive(Clone)]
pub struct PurgeCoordinator {
    query_index: TagIndex,
    page_index: TagIndex,
}

impl PurgeCoordinator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            query_index: TagIndex::new(store.clone(), IndexScope::Query),
            page_index: TagIndex::new(store, IndexScope::Page),
        }
    }

    pub fn query_index(&self) -> &TagIndex {
        &self.query_index
    }

    pub fn page_index(&self) -> &TagIndex {
        &self.page_index
    }

    /// Purge every query entry and page URL registered under `tags`.
    ///
    /// Empty tags are ignored. Failures are logged and reflected only as
    /// missing entries in the report; this never fails.
    #[instrument(skip_all, fields(tag_count = tags.len()))]
    pub async fn purge_by_tags(&self, tags: &[String]) -> PurgeReport {
        let tags: Vec<String> = tags.iter().filter(|tag| !tag.is_empty()).cloned().collect();
        if tags.is_empty() {
            return PurgeReport::default();
        }

        let started = Instant::now();
        let query = purge_scope(&self.query_index, &tags).await;
        let page = purge_scope(&self.page_index, &tags).await;

        let found: BTreeSet<&String> = query.found_tags.iter().chain(&page.found_tags).collect();
        let purged_tags: Vec<String> = tags
            .iter()
            .filter(|tag| found.contains(tag))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect();

        let report = PurgeReport {
            purged_query_keys: query.purged_keys,
            purged_page_urls: page.purged_keys,
            purged_tags,
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_PURGE_MS).record(elapsed_ms);
        counter!(METRIC_PURGED_KEYS_TOTAL, "scope" => IndexScope::Query.as_str())
            .increment(report.purged_query_keys.len() as u64);
        counter!(METRIC_PURGED_KEYS_TOTAL, "scope" => IndexScope::Page.as_str())
            .increment(report.purged_page_urls.len() as u64);

        info!(
            requested = tags.len(),
            purged_tags = report.purged_tags.len(),
            purged_query_keys = report.purged_query_keys.len(),
            purged_page_urls = report.purged_page_urls.len(),
            elapsed_ms,
            "Purged cache by tags"
        );

        report
    }
}

async fn purge_scope(index: &TagIndex, tags: &[String]) -> TagPurge {
    match index.purge(tags).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                scope = index.scope().as_str(),
                error = %err,
                "Tag index purge failed"
            );
            TagPurge::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys::CacheKey;
    use crate::cache::store::MemoryStore;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn put(store: &MemoryStore, key: &str) {
        store
            .put(&CacheKey::from(key), Bytes::from_static(b"{}"), None)
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn purges_both_scopes_and_unions_tags() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let coordinator = PurgeCoordinator::new(store.clone());

        put(&store, "query-1").await;
        put(&store, "https://example.com/a").await;
        coordinator
            .query_index()
            .add_entries(&CacheKey::from("query-1"), &tags(&["a"]))
            .await
            .expect("register query");
        coordinator
            .page_index()
            .add_entries(&CacheKey::from("https://example.com/a"), &tags(&["b"]))
            .await
            .expect("register page");

        let report = coordinator.purge_by_tags(&tags(&["b", "a", "zzz"])).await;

        assert_eq!(report.purged_query_keys, vec!["query-1"]);
        assert_eq!(report.purged_page_urls, vec!["https://example.com/a"]);
        assert_eq!(report.purged_tags, vec!["a", "b"]);
        assert!(store.get(&CacheKey::from("query-1")).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn empty_and_blank_tags_are_a_successful_noop() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let coordinator = PurgeCoordinator::new(store);

        assert!(coordinator.purge_by_tags(&[]).await.is_empty());
        assert!(coordinator.purge_by_tags(&tags(&["", ""])).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_tags_report_nothing() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let coordinator = PurgeCoordinator::new(store);
        let report = coordinator.purge_by_tags(&tags(&["missing"])).await;
        assert!(report.is_empty());
    }
}
