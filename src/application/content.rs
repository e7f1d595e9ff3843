//! Content loading through the query cache.
//!
//! `ContentLoader::load_query` is the single entry point a page render uses
//! to read content. Cache faults never reach the caller; upstream failures
//! always do.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cache::{
    CacheConfig, CacheMode, CacheStatus, CachedResult, Fetched, QueryCache, QueryCacheOptions,
    QueryParams, RequestScope,
};

const METRIC_QUERY_BYPASS_TOTAL: &str = "quire_query_cache_bypass_total";

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content request failed: {0}")]
    Transport(String),
    #[error("content source responded with status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("content response could not be decoded: {0}")]
    Decode(String),
}

impl ContentError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch content")]
    Fetch(#[source] ContentError),
    #[error("content did not match the expected shape")]
    Shape(#[source] serde_json::Error),
}

/// Remote document store answering queries with a result and its sync tags.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, query: &str, params: &QueryParams)
    -> Result<Fetched<Value>, ContentError>;
}

/// Request-facing loader combining a content source with the query cache.
#[derive(Clone)]
pub struct ContentLoader {
    source: Arc<dyn ContentSource>,
    cache: Option<QueryCache>,
    config: CacheConfig,
}

impl ContentLoader {
    /// `cache` is `None` when no store exists in this environment; every load
    /// then goes straight to the source.
    pub fn new(
        source: Arc<dyn ContentSource>,
        cache: Option<QueryCache>,
        config: CacheConfig,
    ) -> Self {
        Self {
            source,
            cache,
            config,
        }
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Load `query`, caching per `mode`, and record its tags in `scope`.
    pub async fn load_query(
        &self,
        query: &str,
        params: &QueryParams,
        mode: &CacheMode<QueryCacheOptions>,
        scope: Option<&RequestScope>,
    ) -> Result<CachedResult<Value>, LoadError> {
        let options = if self.config.enable_query_cache {
            mode.resolve(&self.config.query)
        } else {
            None
        };

        let result = match (&self.cache, options) {
            (Some(cache), Some(options)) => {
                let source = self.source.clone();
                let owned_query = query.to_string();
                let owned_params = params.clone();
                cache
                    .cached_fetch(
                        query,
                        params,
                        move || async move { source.fetch(&owned_query, &owned_params).await },
                        &options,
                        scope.map(RequestScope::background),
                    )
                    .await
            }
            (cache, _) => {
                counter!(METRIC_QUERY_BYPASS_TOTAL).increment(1);
                debug!(
                    cache = "query",
                    outcome = "bypass",
                    store_present = cache.is_some(),
                    "Query cache bypassed"
                );
                self.source
                    .fetch(query, params)
                    .await
                    .map(|fetched| CachedResult {
                        data: fetched.data,
                        tags: fetched.tags,
                        status: CacheStatus::Miss,
                        age: None,
                    })
            }
        }
        .map_err(LoadError::Fetch)?;

        if let Some(scope) = scope {
            scope.record_tags(&result.tags);
        }
        Ok(result)
    }

    /// [`load_query`](Self::load_query), decoding the data into `T`.
    pub async fn load_query_as<T: DeserializeOwned>(
        &self,
        query: &str,
        params: &QueryParams,
        mode: &CacheMode<QueryCacheOptions>,
        scope: Option<&RequestScope>,
    ) -> Result<CachedResult<T>, LoadError> {
        let result = self.load_query(query, params, mode, scope).await?;
        let data = serde_json::from_value(result.data).map_err(LoadError::Shape)?;
        Ok(CachedResult {
            data,
            tags: result.tags,
            status: result.status,
            age: result.age,
        })
    }
}
