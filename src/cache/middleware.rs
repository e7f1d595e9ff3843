//! Page cache middleware.
//!
//! Opens a [`RequestScope`] for every request, sets page cache headers from
//! the tags the handler touched, registers the page URL under those tags,
//! then joins the request's background work off the response path.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, header::HOST},
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::keys::page_key;
use super::page_headers::apply_page_headers;
use super::scope::RequestScope;
use super::tag_index::TagIndex;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub config: CacheConfig,
    /// Page-scope tag index; absent when no store is available.
    pub page_index: Option<TagIndex>,
}

/// Middleware wrapping every request in a [`RequestScope`].
///
/// Handlers reach the scope through `Extension<Arc<RequestScope>>`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cacheable_method = matches!(*request.method(), Method::GET | Method::HEAD);
    let scope = Arc::new(RequestScope::new(absolute_url(&request)));
    request.extensions_mut().insert(scope.clone());

    let mut response = next.run(request).await;

    if cacheable_method
        && response.status().is_success()
        && apply_page_headers(response.headers_mut(), &scope, &cache.config)
    {
        register_page(&cache, &scope);
    }

    finalize(scope);
    response
}

fn register_page(cache: &PageCacheState, scope: &Arc<RequestScope>) {
    let Some(index) = cache.page_index.clone() else {
        return;
    };
    let tags = scope.tags_seen();
    if tags.is_empty() {
        return;
    }

    let key = page_key(scope.url());
    debug!(cache = "page", url = %key, tag_count = tags.len(), "Registering page tags");
    scope.background().spawn("page_tag_register", async move {
        if let Err(err) = index.add_entries(&key, &tags).await {
            warn!(cache = "page", url = %key, error = %err, "Page tag registration failed");
        }
    });
}

/// Join the request's background tasks without holding the response.
fn finalize(scope: Arc<RequestScope>) {
    let tasks = scope.background().clone();
    if tasks.pending() == 0 {
        return;
    }
    tokio::spawn(async move {
        let joined = tasks.join_all().await;
        debug!(joined, "Request background tasks finished");
    });
}

/// Rebuild the absolute URL the client asked for.
fn absolute_url(request: &Request<Body>) -> String {
    let headers = request.headers();
    let scheme = headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| request.uri().scheme_str())
        .unwrap_or("http");
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{scheme}://{host}{path}")
}

#[cfg(test)]
mod tests {
    use axum::{Extension, Router, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::page_headers::{CACHE_TAGS, CDN_CACHE_CONTROL};
    use crate::cache::store::MemoryStore;
    use crate::cache::tag_index::IndexScope;

    async fn tagged(Extension(scope): Extension<Arc<RequestScope>>) -> &'static str {
        scope.record_tags(&["doc-a".to_string()]);
        scope.record_tags(&["doc-b".to_string()]);
        "ok"
    }

    fn app(index: Option<TagIndex>) -> Router {
        let state = PageCacheState {
            config: CacheConfig::default(),
            page_index: index,
        };
        Router::new()
            .route("/posts/hello", get(tagged))
            .route("/studio/desk", get(tagged))
            .layer(middleware::from_fn_with_state(state, page_cache_layer))
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(HOST, "example.com")
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn absolute_url_prefers_forwarded_proto() {
        let req = Request::builder()
            .uri("/a?b=1")
            .header(HOST, "example.com")
            .header(FORWARDED_PROTO, "https, http")
            .body(Body::empty())
            .expect("request");
        assert_eq!(absolute_url(&req), "https://example.com/a?b=1");
    }

    #[test]
    fn absolute_url_defaults() {
        let req = Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("request");
        assert_eq!(absolute_url(&req), "http://localhost/");
    }

    #[tokio::test]
    async fn sets_headers_from_aggregated_tags() {
        let response = app(None)
            .oneshot(request("/posts/hello"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(&CACHE_TAGS)
                .and_then(|v| v.to_str().ok()),
            Some("doc-a,doc-b")
        );
        assert!(response.headers().contains_key(&CDN_CACHE_CONTROL));
    }

    #[tokio::test]
    async fn excluded_routes_get_no_headers() {
        let response = app(None)
            .oneshot(request("/studio/desk"))
            .await
            .expect("response");
        assert!(!response.headers().contains_key(&CACHE_TAGS));
    }

    #[tokio::test]
    async fn registers_page_url_in_page_index() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let index = TagIndex::new(store, IndexScope::Page);

        app(Some(index.clone()))
            .oneshot(request("/posts/hello"))
            .await
            .expect("response");

        let mut registered = index.get().await;
        for _ in 0..50 {
            if !registered.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
            registered = index.get().await;
        }
        assert_eq!(registered["doc-a"], vec!["http://example.com/posts/hello"]);
        assert_eq!(registered["doc-b"], vec!["http://example.com/posts/hello"]);
    }
}
