//! Per-request cache context.
//!
//! One `RequestScope` is created when a request enters the page cache layer
//! and is threaded through every content load made while handling it.

use std::collections::BTreeSet;
use std::sync::Mutex;

use super::background::BackgroundTasks;
use super::config::{CacheMode, PageCacheOptions};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::scope";

#[derive(Debug, Default)]
struct PageState {
    tags_seen: BTreeSet<String>,
    headers_set: bool,
    mode: CacheMode<PageCacheOptions>,
}

/// Typed request-scoped cache state.
pub struct RequestScope {
    url: String,
    path: String,
    background: BackgroundTasks,
    page: Mutex<PageState>,
}

impl RequestScope {
    /// Scope for the absolute request `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url::Url::parse(&url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| "/".to_string());
        Self {
            url,
            path,
            background: BackgroundTasks::new(),
            page: Mutex::new(PageState::default()),
        }
    }

    /// Absolute request URL, also the page cache key.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Fold `tags` into the set seen during this request.
    pub fn record_tags(&self, tags: &[String]) {
        let mut page = mutex_lock(&self.page, SOURCE, "record_tags");
        page.tags_seen
            .extend(tags.iter().filter(|tag| !tag.is_empty()).cloned());
    }

    /// Tags seen so far, sorted.
    pub fn tags_seen(&self) -> Vec<String> {
        mutex_lock(&self.page, SOURCE, "tags_seen")
            .tags_seen
            .iter()
            .cloned()
            .collect()
    }

    /// Override the page cache options for this request only.
    pub fn set_page_mode(&self, mode: CacheMode<PageCacheOptions>) {
        mutex_lock(&self.page, SOURCE, "set_page_mode").mode = mode;
    }

    pub fn page_mode(&self) -> CacheMode<PageCacheOptions> {
        mutex_lock(&self.page, SOURCE, "page_mode").mode.clone()
    }

    /// Claim the right to set page headers. Only the first call returns true.
    pub fn claim_headers(&self) -> bool {
        let mut page = mutex_lock(&self.page, SOURCE, "claim_headers");
        if page.headers_set {
            return false;
        }
        page.headers_set = true;
        true
    }

    pub fn headers_set(&self) -> bool {
        mutex_lock(&self.page, SOURCE, "headers_set").headers_set
    }
}
