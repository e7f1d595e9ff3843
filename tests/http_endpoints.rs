//! HTTP surface tests driven through the router with `oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{
        Method, Request, StatusCode,
        header::{ALLOW, CACHE_CONTROL, CONTENT_TYPE, HOST},
    },
    response::Response,
};
use http_body_util::BodyExt;
use quire::application::content::{ContentError, ContentLoader, ContentSource};
use quire::cache::{
    CACHE_TAGS, CDN_CACHE_CONTROL, CacheConfig, CacheStore, Fetched, MemoryStore,
    PageCacheState, PurgeCoordinator, QueryCache, QueryParams, query_key,
};
use quire::infra::http::{HttpState, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

struct FixedSource;

#[async_trait]
impl ContentSource for FixedSource {
    async fn fetch(
        &self,
        query: &str,
        _params: &QueryParams,
    ) -> Result<Fetched<Value>, ContentError> {
        match query {
            "Q1" => Ok(Fetched {
                data: json!([{ "title": "hello" }]),
                tags: vec!["a".to_string(), "b".to_string()],
            }),
            _ => Err(ContentError::Upstream {
                status: 500,
                message: "boom".to_string(),
            }),
        }
    }
}

fn app_without_store() -> Router {
    app_without_store_with(CacheConfig::default())
}

fn app_without_store_with(config: CacheConfig) -> Router {
    build_router(HttpState {
        loader: ContentLoader::new(Arc::new(FixedSource), None, config.clone()),
        purge: None,
        page: PageCacheState {
            config,
            page_index: None,
        },
    })
}

fn app_with_store() -> Router {
    let config = CacheConfig::default();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(&config));
    let coordinator = PurgeCoordinator::new(store.clone());
    build_router(HttpState {
        loader: ContentLoader::new(
            Arc::new(FixedSource),
            Some(QueryCache::new(store)),
            config.clone(),
        ),
        page: PageCacheState {
            config,
            page_index: Some(coordinator.page_index().clone()),
        },
        purge: Some(coordinator),
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(HOST, "example.com")
        .body(Body::empty())
        .expect("request should build")
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn json_body(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body should be json")
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// Let detached background work (write-through, page registration) run.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn health_is_no_content() {
    let response = send(&app_without_store(), get("/_health")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn purge_rejects_other_methods() {
    let response = send(&app_without_store(), get("/api/cache/purge")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(header(&response, ALLOW.as_str()), Some("POST"));
    assert_eq!(
        json_body(response).await,
        json!({ "success": false, "error": "Method not allowed" })
    );
}

#[tokio::test]
async fn purge_rejects_malformed_bodies() {
    let app = app_without_store();
    for body in [r#"{}"#, r#"{"tags":"a"}"#, "not json"] {
        let response = send(&app, post_json("/api/cache/purge", body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(json_body(response).await["success"], json!(false));
    }
}

#[tokio::test]
async fn purge_without_store_succeeds_empty() {
    let response = send(
        &app_without_store(),
        post_json("/api/cache/purge", r#"{"tags":["a", 7, ""],"eventId":"evt-1"}"#),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({
            "success": true,
            "purgedQueryKeys": [],
            "purgedPageUrls": [],
            "purgedTags": [],
            "eventId": "evt-1"
        })
    );
}

#[tokio::test]
async fn debug_reports_unavailable_without_store() {
    let response = send(&app_without_store(), get("/api/cache/debug")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "available": false }));
}

#[tokio::test]
async fn query_route_requires_query() {
    let response = send(&app_without_store(), get("/api/query")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn query_route_surfaces_upstream_failures() {
    let response = send(&app_without_store(), get("/api/query?query=broken")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        json_body(response).await,
        json!({ "success": false, "error": "Failed to fetch content" })
    );
}

#[tokio::test]
async fn default_exclusions_leave_query_route_cacheable() {
    let response = send(&app_without_store(), get("/api/query?query=Q1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    assert_eq!(header(&response, CACHE_TAGS.as_str()), Some("a,b"));
}

#[tokio::test]
async fn excluded_prefixes_skip_page_headers() {
    let app = app_without_store_with(CacheConfig {
        excluded_page_prefixes: vec!["/api".to_string()],
        ..CacheConfig::default()
    });
    let response = send(&app, get("/api/query?query=Q1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    assert!(!response.headers().contains_key(&CDN_CACHE_CONTROL));
}

#[tokio::test]
async fn query_debug_and_purge_round_trip() {
    let app = app_with_store();
    let page_url = "http://example.com/api/query?query=Q1";
    let query_cache_key = query_key("Q1", &QueryParams::new(), "query").into_string();

    let response = send(&app, get("/api/query?query=Q1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    assert_eq!(header(&response, CACHE_TAGS.as_str()), Some("a,b"));
    assert_eq!(
        header(&response, CDN_CACHE_CONTROL.as_str()),
        Some("public, max-age=60, stale-while-revalidate=300")
    );
    assert_eq!(
        header(&response, CACHE_CONTROL.as_str()),
        Some("public, max-age=0, must-revalidate")
    );
    let body = json_body(response).await;
    assert_eq!(body["status"], json!("MISS"));
    assert_eq!(body["tags"], json!(["a", "b"]));
    settle().await;

    let response = send(&app, get("/api/query?query=Q1")).await;
    assert_eq!(header(&response, "x-cache"), Some("HIT"));
    settle().await;

    let debug = json_body(send(&app, get("/api/cache/debug")).await).await;
    assert_eq!(debug["available"], json!(true));
    assert_eq!(debug["tagCount"], json!(2));
    assert_eq!(debug["keyCount"], json!(1));
    assert_eq!(debug["tagIndex"]["a"], json!([query_cache_key]));
    assert_eq!(debug["pageUrlCount"], json!(1));
    assert_eq!(debug["pageIndex"]["b"], json!([page_url]));

    let response = send(
        &app,
        post_json("/api/cache/purge", r#"{"tags":["a","unknown"],"eventId":"evt-2"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({
            "success": true,
            "purgedQueryKeys": [query_cache_key],
            "purgedPageUrls": [page_url],
            "purgedTags": ["a"],
            "eventId": "evt-2"
        })
    );

    let debug = json_body(send(&app, get("/api/cache/debug")).await).await;
    assert_eq!(debug["keyCount"], json!(0));
    assert_eq!(debug["pageUrlCount"], json!(0));

    let response = send(&app, get("/api/query?query=Q1")).await;
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
}

#[tokio::test]
async fn page_cache_can_be_disabled_per_request() {
    let response = send(&app_with_store(), get("/api/query?query=Q1&pageCache=false")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(&CACHE_TAGS));
}
