//! Outbound cache headers for full-page responses.
//!
//! Page bytes are cached by the edge in front of the origin; this module only
//! tells it how long to keep them and which tags they depend on.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header::CACHE_CONTROL};
use tracing::{debug, warn};

use super::config::{CacheConfig, PageCacheOptions};
use super::scope::RequestScope;

pub const CDN_CACHE_CONTROL: HeaderName = HeaderName::from_static("cdn-cache-control");
pub const CACHE_TAGS: HeaderName = HeaderName::from_static("x-sanity-tags");

/// The three header values for one page response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDirectives {
    /// Shared edge cache directive.
    pub edge: String,
    /// Browser cache directive.
    pub browser: String,
    /// Comma-joined tag list, for debugging.
    pub tags: String,
}

/// Compute directives for `tags`; `None` when page caching is disabled.
pub fn directives(tags: &[String], options: &PageCacheOptions) -> Option<PageDirectives> {
    if options.disabled {
        return None;
    }
    Some(PageDirectives {
        edge: format!(
            "public, max-age={}, stale-while-revalidate={}",
            options.max_age, options.stale_while_revalidate
        ),
        browser: format!("public, max-age={}, must-revalidate", options.browser_max_age),
        tags: tags.join(","),
    })
}

/// Set page cache headers once per request.
///
/// Returns whether headers were written. Nothing is written when page caching
/// is off for this request, the path is excluded, or an earlier call already
/// set them.
pub fn apply_page_headers(
    headers: &mut HeaderMap,
    scope: &RequestScope,
    config: &CacheConfig,
) -> bool {
    if !config.enable_page_cache || config.is_page_excluded(scope.path()) {
        return false;
    }
    let Some(options) = scope.page_mode().resolve(&config.page) else {
        return false;
    };
    let Some(directives) = directives(&scope.tags_seen(), &options) else {
        return false;
    };
    if !scope.claim_headers() {
        debug!(cache = "page", path = scope.path(), "Page cache headers already set");
        return false;
    }

    for (name, value) in [
        (CDN_CACHE_CONTROL, directives.edge),
        (CACHE_CONTROL, directives.browser),
        (CACHE_TAGS, directives.tags),
    ] {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(err) => warn!(
                cache = "page",
                header = %name,
                error = %err,
                "Skipping unrepresentable page cache header"
            ),
        }
    }
    true
}
