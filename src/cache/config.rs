//! Cache configuration.
//!
//! Controls the query cache, page cache headers and the invalidation consumer
//! via `quire.toml`, plus the per-call option types accepted by
//! [`ContentLoader::load_query`](crate::application::content::ContentLoader::load_query).

use std::num::NonZeroUsize;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_QUERY_MAX_AGE_SECS: u64 = 60;
const DEFAULT_QUERY_SWR_SECS: u64 = 300;
const DEFAULT_QUERY_KEY_PREFIX: &str = "query";
const DEFAULT_PAGE_MAX_AGE_SECS: u64 = 60;
const DEFAULT_PAGE_SWR_SECS: u64 = 300;
const DEFAULT_PAGE_BROWSER_MAX_AGE_SECS: u64 = 0;
const DEFAULT_STORE_CAPACITY: usize = 1000;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1000;
const DEFAULT_EXCLUDED_PAGE_PREFIXES: [&str; 2] = ["/api/cache", "/studio"];

/// Freshness options for one cached query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryCacheOptions {
    /// Seconds an entry is served as a HIT.
    pub max_age: u64,
    /// Seconds past `max_age` during which the entry is served STALE.
    pub stale_while_revalidate: u64,
    /// Namespace folded into every cache key.
    pub key_prefix: String,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_QUERY_MAX_AGE_SECS,
            stale_while_revalidate: DEFAULT_QUERY_SWR_SECS,
            key_prefix: DEFAULT_QUERY_KEY_PREFIX.to_string(),
        }
    }
}

/// Header options for the full-page cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PageCacheOptions {
    pub max_age: u64,
    pub stale_while_revalidate: u64,
    pub browser_max_age: u64,
    pub disabled: bool,
}

impl Default for PageCacheOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_PAGE_MAX_AGE_SECS,
            stale_while_revalidate: DEFAULT_PAGE_SWR_SECS,
            browser_max_age: DEFAULT_PAGE_BROWSER_MAX_AGE_SECS,
            disabled: false,
        }
    }
}

/// Per-call cache setting: `false` bypasses caching, `true` uses the
/// configured defaults, an options object overrides them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CacheMode<T> {
    Toggle(bool),
    Options(T),
}

impl<T: Clone> CacheMode<T> {
    /// Resolve against the configured defaults; `None` means bypass.
    pub fn resolve(&self, defaults: &T) -> Option<T> {
        match self {
            CacheMode::Toggle(false) => None,
            CacheMode::Toggle(true) => Some(defaults.clone()),
            CacheMode::Options(options) => Some(options.clone()),
        }
    }
}

impl<T> Default for CacheMode<T> {
    fn default() -> Self {
        CacheMode::Toggle(true)
    }
}

impl<T> From<T> for CacheMode<T> {
    fn from(options: T) -> Self {
        CacheMode::Options(options)
    }
}

/// Cache configuration from `quire.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the query-result cache.
    pub enable_query_cache: bool,
    /// Enable page cache headers and page tag registration.
    pub enable_page_cache: bool,
    /// Whether a cache store is present in this environment.
    pub enable_store: bool,
    /// Default query freshness options.
    pub query: QueryCacheOptions,
    /// Default page header options.
    pub page: PageCacheOptions,
    /// Route prefixes that never receive page cache headers.
    pub excluded_page_prefixes: Vec<String>,
    /// Maximum entries held by the in-memory store.
    pub store_capacity: usize,
    /// Auto-consume interval (ms) for queued invalidation events.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Maximum pending events before new ones are dropped.
    pub event_queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_query_cache: true,
            enable_page_cache: true,
            enable_store: true,
            query: QueryCacheOptions::default(),
            page: PageCacheOptions::default(),
            excluded_page_prefixes: DEFAULT_EXCLUDED_PAGE_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            store_capacity: DEFAULT_STORE_CAPACITY,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_query_cache: settings.query_enabled,
            enable_page_cache: settings.page_enabled,
            enable_store: settings.store_enabled,
            query: settings.query.clone(),
            page: settings.page.clone(),
            excluded_page_prefixes: settings.excluded_page_prefixes.clone(),
            store_capacity: settings.store_capacity.get(),
            auto_consume_interval_ms: settings.auto_consume_interval.as_millis() as u64,
            consume_batch_limit: settings.consume_batch_limit.get(),
            event_queue_limit: settings.event_queue_limit.get(),
        }
    }
}

impl CacheConfig {
    /// Returns true if any cache layer is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enable_query_cache || self.enable_page_cache
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns true when `path` falls under an excluded page prefix.
    ///
    /// Prefixes match whole path segments: `/studio` covers `/studio` and
    /// `/studio/desk`, not `/studios`.
    pub fn is_page_excluded(&self, path: &str) -> bool {
        self.excluded_page_prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            if prefix.is_empty() {
                return false;
            }
            path.strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']))
        })
    }
}
