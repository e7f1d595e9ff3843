//! Quire edge cache.
//!
//! Two cooperating caches over one shared key-value store:
//!
//! - **Query cache**: upstream query results with stale-while-revalidate
//! - **Page cache**: response headers telling the edge how long to keep a page,
//!   plus a page tag index so pages can be purged with the content they show
//!
//! Both are invalidated by tag, either through the purge endpoint or the
//! push-event listener feeding the [`EventQueue`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache.query]
//! enabled = true
//! max_age = 60
//! stale_while_revalidate = 300
//!
//! [cache.page]
//! enabled = true
//! browser_max_age = 0
//! # ... see config.rs for all options
//! ```

mod background;
mod config;
mod consumer;
mod engine;
mod events;
mod freshness;
mod keys;
mod lock;
mod middleware;
mod page_headers;
mod planner;
mod purge;
mod scope;
mod store;
mod tag_index;

pub use background::BackgroundTasks;
pub use config::{CacheConfig, CacheMode, PageCacheOptions, QueryCacheOptions};
pub use consumer::PurgeConsumer;
pub use engine::{CacheStatus, CachedResult, Fetched, QueryCache};
pub use events::{Epoch, EventQueue, InvalidationEvent};
pub use freshness::{EntryTiming, Freshness, classify};
pub use keys::{CacheKey, QueryParams, page_key, query_key};
pub use middleware::{PageCacheState, page_cache_layer};
pub use page_headers::{
    CACHE_TAGS, CDN_CACHE_CONTROL, PageDirectives, apply_page_headers, directives,
};
pub use planner::PurgePlan;
pub use purge::{PurgeCoordinator, PurgeReport};
pub use scope::RequestScope;
pub use store::{CacheEntry, CacheStore, EntryStore, MemoryStore, StoreError};
pub use tag_index::{IndexScope, TagIndex, TagMap, TagPurge, distinct_key_count};

pub(crate) use engine::METRIC_STORE_ERROR_TOTAL;
